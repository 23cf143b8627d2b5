//! Bounded schema-less extension payloads.
//!
//! Platform entities carry a small typed core plus one `extensions` field for
//! integrator-defined data. The platform never interprets extension values;
//! they are opaque and reachable only by string key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};

/// Maximum number of extension keys per entity.
const MAX_KEYS: usize = 32;

/// Maximum serialized size of a single extension value, in bytes.
const MAX_VALUE_BYTES: usize = 4096;

/// Opaque, bounded key/value extension map.
///
/// BTreeMap keeps serialization order deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extensions(BTreeMap<String, JsonValue>);

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, enforcing the key-count and value-size bounds.
    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) -> DomainResult<()> {
        let key = key.into();
        if !self.0.contains_key(&key) && self.0.len() >= MAX_KEYS {
            return Err(DomainError::validation(format!(
                "extensions limited to {MAX_KEYS} keys"
            )));
        }
        let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        if size > MAX_VALUE_BYTES {
            return Err(DomainError::validation(format!(
                "extension value for '{key}' exceeds {MAX_VALUE_BYTES} bytes"
            )));
        }
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_and_get() {
        let mut ext = Extensions::new();
        ext.insert("erp_ref", json!("PO-991")).unwrap();
        assert_eq!(ext.get("erp_ref"), Some(&json!("PO-991")));
        assert_eq!(ext.get("missing"), None);
    }

    #[test]
    fn key_count_is_bounded() {
        let mut ext = Extensions::new();
        for i in 0..MAX_KEYS {
            ext.insert(format!("k{i}"), json!(i)).unwrap();
        }
        assert!(ext.insert("overflow", json!(1)).is_err());
        // Replacing an existing key is still allowed at the cap.
        assert!(ext.insert("k0", json!("replaced")).is_ok());
    }

    #[test]
    fn oversized_value_rejected() {
        let mut ext = Extensions::new();
        let big = "x".repeat(MAX_VALUE_BYTES + 1);
        assert!(ext.insert("big", json!(big)).is_err());
    }
}
