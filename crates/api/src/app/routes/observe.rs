//! Read surfaces over backbone-owned state: saga records, stock levels,
//! ledger balances, loyalty points, daily aggregates.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::authz::{guard, Identity};

pub fn router() -> Router {
    Router::new()
        .route("/sagas/:saga_type/:correlation_id", get(saga_record))
        .route("/stock/:sku", get(stock_level))
        .route("/stock/:sku/level", put(set_stock_level))
        .route("/ledger/balances/:account", get(ledger_balance))
        .route("/loyalty/:customer_id", get(loyalty_balance))
        .route("/reports/daily/:date", get(daily_report))
}

pub async fn saga_record(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Path((saga_type, correlation_id)): Path<(String, String)>,
) -> axum::response::Response {
    match services
        .sagas
        .load(&saga_type, context.tenant_id(), &correlation_id)
    {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "not_found", "no such saga"),
    }
}

pub async fn stock_level(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Path(sku): Path<String>,
) -> axum::response::Response {
    let level = services.stock.level(context.tenant_id(), &sku);
    (StatusCode::OK, Json(json!({"sku": sku, "level": level}))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SetLevelRequest {
    pub level: i64,
}

/// Seed/correct a stock level (stocktake adjustment).
pub async fn set_stock_level(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Path(sku): Path<String>,
    Json(body): Json<SetLevelRequest>,
) -> axum::response::Response {
    if let Err(response) = guard(&context, "inventory.stock.adjust") {
        return response;
    }
    services
        .stock
        .set_level(context.tenant_id(), &sku, body.level);
    (
        StatusCode::OK,
        Json(json!({"sku": sku, "level": body.level})),
    )
        .into_response()
}

pub async fn ledger_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Path(account): Path<String>,
) -> axum::response::Response {
    let balance = services.journal.balance(context.tenant_id(), &account);
    (
        StatusCode::OK,
        Json(json!({"account": account, "balance": balance.to_string()})),
    )
        .into_response()
}

pub async fn loyalty_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Path(customer_id): Path<String>,
) -> axum::response::Response {
    let points = services.loyalty.balance(context.tenant_id(), &customer_id);
    (
        StatusCode::OK,
        Json(json!({"customer_id": customer_id, "points": points})),
    )
        .into_response()
}

pub async fn daily_report(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Path(date): Path<String>,
) -> axum::response::Response {
    let date: NaiveDate = match date.parse() {
        Ok(date) => date,
        Err(_) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "date must be YYYY-MM-DD",
            )
        }
    };
    let aggregate = services.reporting.daily(context.tenant_id(), date);
    (StatusCode::OK, Json(aggregate)).into_response()
}
