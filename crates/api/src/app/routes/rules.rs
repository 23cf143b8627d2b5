use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use loomerp_engine::{ActionKind, Condition, Rule, Schedule};

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::authz::{guard, Identity};

pub fn router() -> Router {
    Router::new()
        .route("/rules", post(create_rule).get(list_rules))
        .route("/actions/failures", get(list_action_failures))
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub trigger_event: String,
    #[serde(default)]
    pub condition: Option<Condition>,
    pub action: ActionKind,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

pub async fn create_rule(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Json(body): Json<CreateRuleRequest>,
) -> axum::response::Response {
    if let Err(response) = guard(&context, "engine.rules.manage") {
        return response;
    }
    if body.trigger_event.is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "trigger_event must not be empty",
        );
    }

    let mut rule = Rule::new(
        context.tenant_id(),
        body.trigger_event,
        body.condition,
        body.action,
    );
    if let Some(schedule) = body.schedule {
        rule = rule.with_schedule(schedule);
    }
    let id = rule.id;
    services.rules.save(rule);

    (StatusCode::CREATED, Json(json!({"id": id}))).into_response()
}

pub async fn list_rules(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
) -> axum::response::Response {
    let items = services.rules.list(context.tenant_id());
    (StatusCode::OK, Json(json!({"items": items}))).into_response()
}

/// Actions that exhausted their retry budget.
pub async fn list_action_failures(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
) -> axum::response::Response {
    let items = services.action_log.list(context.tenant_id(), 100);
    (StatusCode::OK, Json(json!({"items": items}))).into_response()
}
