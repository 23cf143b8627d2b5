use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use loomerp_ledger::verify_chain;

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::authz::Identity;

pub fn router() -> Router {
    Router::new()
        .route("/audit/verify", get(verify))
        .route("/audit/head", get(head))
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub start_sequence: Option<u64>,
    pub limit: Option<usize>,
}

/// Walk the caller's chain segment and report integrity. Read-only.
pub async fn verify(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Query(query): Query<VerifyQuery>,
) -> axum::response::Response {
    match verify_chain(
        services.chain.as_ref(),
        context.tenant_id(),
        query.start_sequence,
        query.limit,
    )
    .await
    {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ledger_error",
            e.to_string(),
        ),
    }
}

/// The chain tail (sequence + hash), for operators comparing snapshots.
pub async fn head(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
) -> axum::response::Response {
    match services.chain.tail(context.tenant_id()).await {
        Ok(Some(tail)) => (
            StatusCode::OK,
            Json(json!({"sequence": tail.sequence, "hash": tail.hash})),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::OK,
            Json(json!({"sequence": 0, "hash": loomerp_ledger::GENESIS_HASH})),
        )
            .into_response(),
        Err(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ledger_error",
            e.to_string(),
        ),
    }
}
