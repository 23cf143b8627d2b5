//! Token claims model (transport-agnostic).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use loomerp_core::{BranchId, TenantId, UserId};

/// Claims recognized in a platform bearer token.
///
/// Issuing services vary in field naming (`tenant_id` vs `company_uuid`,
/// `sub` vs `user_id`); the serde aliases absorb that so every consumer sees
/// one shape. Unrecognized claims are preserved in `raw`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Tenant scope for the token.
    #[serde(alias = "company_uuid")]
    pub tenant_id: TenantId,

    /// Subject / user identifier.
    #[serde(alias = "user_id")]
    pub sub: UserId,

    /// Branch scope, when the principal is branch-bound.
    #[serde(default)]
    pub branch_id: Option<BranchId>,

    /// Role names granted within the tenant.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Permission strings granted within the tenant.
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Privileged principals bypass the permission gate.
    #[serde(default)]
    pub is_superuser: bool,

    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,

    /// Audience.
    #[serde(default)]
    pub aud: Option<String>,

    /// Expiry (seconds since epoch). Enforced by the verifier.
    pub exp: i64,

    /// Everything else the issuer put in the token.
    #[serde(flatten)]
    pub raw: Map<String, JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aliases_absorb_issuer_variants() {
        let tenant = TenantId::new();
        let user = UserId::new();

        let legacy = json!({
            "company_uuid": tenant,
            "user_id": user,
            "exp": 2_000_000_000i64,
        });
        let claims: TokenClaims = serde_json::from_value(legacy).unwrap();
        assert_eq!(claims.tenant_id, tenant);
        assert_eq!(claims.sub, user);
        assert!(claims.roles.is_empty());
        assert!(!claims.is_superuser);
    }

    #[test]
    fn unknown_claims_are_preserved() {
        let value = json!({
            "tenant_id": TenantId::new(),
            "sub": UserId::new(),
            "exp": 2_000_000_000i64,
            "shift_code": "NIGHT-2",
        });
        let claims: TokenClaims = serde_json::from_value(value).unwrap();
        assert_eq!(claims.raw.get("shift_code"), Some(&json!("NIGHT-2")));
    }
}
