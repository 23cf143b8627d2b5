//! Handler-side identity and permission enforcement.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::Response,
};

use loomerp_auth::{require_permission, Permission, TenantContext};

use crate::app::errors::json_error;

/// Extractor for the request's [`TenantContext`].
///
/// Rejects with 401 `missing_token` when the identity middleware attached
/// nothing — which is exactly the missing-token case on non-exempt paths.
pub struct Identity(pub TenantContext);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .cloned()
            .map(Identity)
            .ok_or_else(|| {
                json_error(
                    StatusCode::UNAUTHORIZED,
                    "missing_token",
                    "authentication required",
                )
            })
    }
}

/// Enforce a permission for the current operation.
///
/// The 403 body never reveals whether the target resource exists.
pub fn guard(context: &TenantContext, permission: &'static str) -> Result<(), Response> {
    require_permission(context, &Permission::new(permission)).map_err(|denied| {
        tracing::debug!(
            tenant_id = %context.tenant_id(),
            user_id = %context.user_id(),
            required = %denied.required,
            "permission denied"
        );
        json_error(StatusCode::FORBIDDEN, "permission_denied", "permission denied")
    })
}
