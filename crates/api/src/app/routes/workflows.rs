use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use loomerp_core::InstanceId;
use loomerp_engine::{Edge, Node, Workflow};

use crate::app::errors::{domain_error_to_response, json_error};
use crate::app::services::AppServices;
use crate::authz::{guard, Identity};

pub fn router() -> Router {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflow-instances", get(list_instances))
        .route("/workflow-instances/:id/approve", post(approve_instance))
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

pub async fn create_workflow(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Json(body): Json<CreateWorkflowRequest>,
) -> axum::response::Response {
    if let Err(response) = guard(&context, "engine.workflows.manage") {
        return response;
    }

    let workflow = match Workflow::new(context.tenant_id(), body.name, body.nodes, body.edges) {
        Ok(workflow) => workflow,
        Err(e) => return domain_error_to_response(e),
    };
    let id = workflow.id;
    services.workflows.save(workflow);

    (StatusCode::CREATED, Json(json!({"id": id}))).into_response()
}

pub async fn list_workflows(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
) -> axum::response::Response {
    let items = services.workflows.list(context.tenant_id());
    (StatusCode::OK, Json(json!({"items": items}))).into_response()
}

pub async fn list_instances(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
) -> axum::response::Response {
    let items = services.instances.list(context.tenant_id());
    (StatusCode::OK, Json(json!({"items": items}))).into_response()
}

/// The external "approve" signal that resumes a parked instance.
pub async fn approve_instance(
    Extension(services): Extension<Arc<AppServices>>,
    Identity(context): Identity,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(response) = guard(&context, "engine.workflows.approve") {
        return response;
    }
    let id: InstanceId = match id.parse() {
        Ok(id) => id,
        Err(_) => {
            return json_error(StatusCode::BAD_REQUEST, "invalid_id", "malformed instance id")
        }
    };
    // Resuming may run action nodes (blocking IO); keep it off the async
    // workers.
    let tenant_id = context.tenant_id();
    let result = tokio::task::spawn_blocking(move || {
        services.evaluator.approve_instance(tenant_id, id)
    })
    .await;

    match result {
        Ok(Ok(instance)) => (
            StatusCode::OK,
            Json(json!({"id": instance.id, "state": instance.state})),
        )
            .into_response(),
        Ok(Err(e)) => domain_error_to_response(e),
        Err(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "approval task failed",
        ),
    }
}
