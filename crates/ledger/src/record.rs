//! Audit records and the hash computation that chains them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use loomerp_core::{TenantId, UserId};

use crate::canonical::canonical_json;

/// `previous_hash` of the first record in every tenant chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Body digests are truncated copies, not hashes: the first
/// `DIGEST_MAX_BYTES` bytes with invalid UTF-8 replaced.
pub const DIGEST_MAX_BYTES: usize = 2_000;

/// One link in a tenant's audit chain. Append-only: never updated, never
/// deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic per-tenant position, starting at 1.
    pub sequence: u64,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub service_name: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub request_digest: String,
    pub response_digest: String,
    pub occurred_at: DateTime<Utc>,
    /// Hash of the predecessor record, or [`GENESIS_HASH`] at sequence 1.
    pub previous_hash: String,
    /// SHA-256 over the canonical JSON of every other field.
    pub hash: String,
}

/// Record fields captured from the observed request, before chaining.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub user_id: UserId,
    pub service_name: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub request_digest: String,
    pub response_digest: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Chain a draft onto the tail `(sequence, hash)` (or start the chain).
    pub fn chained(
        tenant_id: TenantId,
        tail: Option<(u64, &str)>,
        draft: RecordDraft,
    ) -> Self {
        let (sequence, previous_hash) = match tail {
            Some((seq, hash)) => (seq + 1, hash.to_string()),
            None => (1, GENESIS_HASH.to_string()),
        };
        let mut record = Self {
            sequence,
            tenant_id,
            user_id: draft.user_id,
            service_name: draft.service_name,
            method: draft.method,
            path: draft.path,
            status_code: draft.status_code,
            request_digest: draft.request_digest,
            response_digest: draft.response_digest,
            occurred_at: draft.occurred_at,
            previous_hash,
            hash: String::new(),
        };
        record.hash = record.compute_hash();
        record
    }

    /// SHA-256 over the canonical JSON of every field except `hash`.
    pub fn compute_hash(&self) -> String {
        let fields = json!({
            "sequence": self.sequence,
            "tenant_id": self.tenant_id,
            "user_id": self.user_id,
            "service_name": self.service_name,
            "method": self.method,
            "path": self.path,
            "status_code": self.status_code,
            "request_digest": self.request_digest,
            "response_digest": self.response_digest,
            "occurred_at": self.occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "previous_hash": self.previous_hash,
        });
        let canonical = canonical_json(&fields);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Truncate a body into its stored digest form.
pub fn body_digest(body: &[u8]) -> String {
    let slice = &body[..body.len().min(DIGEST_MAX_BYTES)];
    String::from_utf8_lossy(slice).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(request_digest: &str) -> RecordDraft {
        RecordDraft {
            user_id: UserId::new(),
            service_name: "pos".to_string(),
            method: "POST".to_string(),
            path: "/pos/orders".to_string(),
            status_code: 201,
            request_digest: request_digest.to_string(),
            response_digest: "{}".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn genesis_record() {
        let record = AuditRecord::chained(TenantId::new(), None, draft("A"));
        assert_eq!(record.sequence, 1);
        assert_eq!(record.previous_hash, GENESIS_HASH);
        assert_eq!(record.hash.len(), 64);
        assert_eq!(record.hash, record.compute_hash());
    }

    #[test]
    fn successor_links_to_predecessor() {
        let tenant = TenantId::new();
        let first = AuditRecord::chained(tenant, None, draft("A"));
        let second = AuditRecord::chained(tenant, Some((first.sequence, &first.hash)), draft("B"));
        assert_eq!(second.sequence, 2);
        assert_eq!(second.previous_hash, first.hash);
    }

    #[test]
    fn identical_fields_hash_identically() {
        let tenant = TenantId::new();
        let d = draft("A");
        let one = AuditRecord::chained(tenant, None, d.clone());
        let two = AuditRecord::chained(tenant, None, RecordDraft {
            user_id: d.user_id,
            occurred_at: d.occurred_at,
            ..draft("A")
        });
        assert_eq!(one.hash, two.hash);
    }

    #[test]
    fn mutation_changes_recomputed_hash() {
        let mut record = AuditRecord::chained(TenantId::new(), None, draft("A"));
        let stored = record.hash.clone();
        record.request_digest = "A'".to_string();
        assert_ne!(record.compute_hash(), stored);
    }

    #[test]
    fn digest_truncates_and_replaces_invalid_utf8() {
        let long = vec![b'x'; DIGEST_MAX_BYTES + 500];
        assert_eq!(body_digest(&long).len(), DIGEST_MAX_BYTES);

        let invalid = [b'o', b'k', 0xFF, 0xFE];
        let digest = body_digest(&invalid);
        assert!(digest.starts_with("ok"));
        assert!(digest.contains('\u{FFFD}'));
    }
}
