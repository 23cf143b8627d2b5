use std::sync::Arc;

use axum::{
    extract::Extension, http::StatusCode, response::IntoResponse, routing::post, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use loomerp_bus::{Event, RoutingKey, EVENTS_EXCHANGE};

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::authz::{guard, Identity};

pub fn router() -> Router {
    Router::new().route("/events", post(publish_event))
}

#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    pub routing_key: String,
    pub body: JsonValue,
}

/// Publish a tenant-scoped event onto the fabric. This is how edge services
/// without their own broker connection hand events in.
pub async fn publish_event(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Json(body): Json<PublishEventRequest>,
) -> axum::response::Response {
    if let Err(response) = guard(&context, "events.publish") {
        return response;
    }

    let routing_key: RoutingKey = match body.routing_key.parse() {
        Ok(key) => key,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };
    let event = Event::tenant_scoped(routing_key, context.tenant_id(), body.body);

    // The publisher buffers on transient broker trouble; only a permanent
    // refusal reaches the caller.
    match services.publisher.publish(EVENTS_EXCHANGE, &event) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "routing_key": event.routing_key,
                "occurred_at": event.occurred_at,
            })),
        )
            .into_response(),
        Err(e) => json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string()),
    }
}
