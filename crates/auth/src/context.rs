//! Per-request tenant/identity context.

use std::collections::HashSet;

use serde_json::{Map, Value as JsonValue};

use loomerp_core::{BranchId, TenantId, UserId};

use crate::claims::TokenClaims;

/// Identity context attached to a request after token verification.
///
/// Immutable for the lifetime of the request. If a mutating handler runs,
/// one of these is present or the route is on the explicit exempt list.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant_id: TenantId,
    user_id: UserId,
    branch_id: Option<BranchId>,
    roles: HashSet<String>,
    permissions: HashSet<String>,
    is_privileged: bool,
    raw_claims: Map<String, JsonValue>,
}

impl TenantContext {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn branch_id(&self) -> Option<BranchId> {
        self.branch_id
    }

    pub fn roles(&self) -> &HashSet<String> {
        &self.roles
    }

    pub fn permissions(&self) -> &HashSet<String> {
        &self.permissions
    }

    pub fn is_privileged(&self) -> bool {
        self.is_privileged
    }

    pub fn raw_claims(&self) -> &Map<String, JsonValue> {
        &self.raw_claims
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission) || self.permissions.contains("*")
    }
}

impl From<TokenClaims> for TenantContext {
    fn from(claims: TokenClaims) -> Self {
        Self {
            tenant_id: claims.tenant_id,
            user_id: claims.sub,
            branch_id: claims.branch_id,
            roles: claims.roles.into_iter().collect(),
            permissions: claims.permissions.into_iter().collect(),
            is_privileged: claims.is_superuser,
            raw_claims: claims.raw,
        }
    }
}
