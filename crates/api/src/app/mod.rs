//! HTTP application wiring (axum router + middleware stack).
//!
//! Layer order, outermost first: identity extraction → audit writer →
//! request extensions. Identity must run first so the audit record can be
//! attributed; the writer only observes mutating methods on non-exempt
//! paths.

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use loomerp_auth::TokenVerifier;
use loomerp_ledger::{audit_middleware, AuditWriterConfig, AuditWriterState};

use crate::middleware::{self, AuthState};

pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_services, AppServices};

/// Build the full router over an existing service graph.
pub fn build_app(services: Arc<AppServices>, verifier: Arc<dyn TokenVerifier>) -> Router {
    let auth_state = AuthState { verifier };
    let audit_state = AuditWriterState {
        store: services.chain.clone(),
        publisher: Some(services.publisher.clone()),
        config: Arc::new(AuditWriterConfig::from_env(service_name())),
    };

    // ServiceBuilder applies top-to-bottom, outermost first.
    let protected = routes::router().layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn_with_state(
                auth_state,
                middleware::identity_middleware,
            ))
            .layer(axum::middleware::from_fn_with_state(
                audit_state,
                audit_middleware,
            ))
            .layer(Extension(services)),
    );

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
}

fn service_name() -> String {
    std::env::var("SERVICE_NAME").unwrap_or_else(|_| "platform".to_string())
}
