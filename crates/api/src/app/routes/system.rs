use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::authz::Identity;

pub fn router() -> Router {
    Router::new().route("/whoami", get(whoami))
}

/// Liveness probe; mounted outside the identity middleware.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// Echo the extracted identity context (diagnostic).
pub async fn whoami(Identity(context): Identity) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "tenant_id": context.tenant_id(),
            "user_id": context.user_id(),
            "branch_id": context.branch_id(),
            "roles": context.roles(),
            "permissions": context.permissions(),
            "is_privileged": context.is_privileged(),
        })),
    )
}
