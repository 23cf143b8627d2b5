//! The permission gate.
//!
//! A handler declares the permission string its operation requires; the gate
//! permits the call iff the context is privileged or holds that permission.
//! Read-only handlers may declare nothing and stay permission-free.

use thiserror::Error;

use crate::context::TenantContext;
use crate::permissions::Permission;

/// Denial from the permission gate. Surfaced as 403 at the HTTP edge;
/// the message never reveals whether the target resource exists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("permission denied")]
pub struct PermissionError {
    /// The permission that was missing (for logs, not for responses).
    pub required: String,
}

/// Check a required permission against the request context.
///
/// - No IO
/// - No panics
/// - Pure policy: privileged principals pass unconditionally
pub fn require_permission(
    context: &TenantContext,
    required: &Permission,
) -> Result<(), PermissionError> {
    if context.is_privileged() || context.has_permission(required.as_str()) {
        Ok(())
    } else {
        Err(PermissionError {
            required: required.as_str().to_string(),
        })
    }
}
