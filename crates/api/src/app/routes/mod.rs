//! HTTP routes, one file per area.

use axum::Router;

pub mod audit;
pub mod events;
pub mod observe;
pub mod rules;
pub mod system;
pub mod workflows;

/// Routes behind the identity middleware.
pub fn router() -> Router {
    Router::new()
        .merge(system::router())
        .merge(audit::router())
        .merge(rules::router())
        .merge(workflows::router())
        .merge(events::router())
        .merge(observe::router())
}
