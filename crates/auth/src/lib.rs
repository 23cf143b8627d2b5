//! `loomerp-auth` — identity extraction and the permission gate.
//!
//! One implementation for every service: token claims, RS256 verification,
//! the per-request `TenantContext`, and the pure permission check. This crate
//! never touches a database; everything a decision needs is in the token.

pub mod claims;
pub mod context;
pub mod exempt;
pub mod gate;
pub mod permissions;
pub mod verifier;

pub use claims::TokenClaims;
pub use context::TenantContext;
pub use exempt::is_exempt;
pub use gate::{require_permission, PermissionError};
pub use permissions::Permission;
pub use verifier::{AuthError, Rs256Verifier, TokenVerifier, VerifierConfig};
