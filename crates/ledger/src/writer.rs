//! Audit writer middleware.
//!
//! Observes every completed mutating request (POST/PUT/PATCH/DELETE) and
//! appends a record to the tenant's chain. The writer never fails the
//! observed request: persistence errors are logged and the response goes out
//! unchanged. The one exception is strict mode, where exhausted contention
//! retries surface as 503. Bus fan-out is fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use loomerp_auth::{is_exempt, TenantContext};
use loomerp_bus::{EventPublisher, AUDIT_LOGS_EXCHANGE};
use loomerp_core::TenantId;

use crate::record::{body_digest, RecordDraft};
use crate::store::{ChainStore, LedgerError};

/// Request/response bodies larger than this are not buffered for auditing;
/// the digest records a marker instead.
const MAX_OBSERVED_BODY: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct AuditWriterConfig {
    /// Name this service writes into its records.
    pub service_name: String,
    /// Surface 503 when contention retries run out (default: fail open).
    pub strict: bool,
    /// Append attempts before giving up on a contended chain.
    pub append_attempts: u32,
    /// Base delay between attempts (doubles each retry).
    pub retry_delay: Duration,
}

impl AuditWriterConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            strict: false,
            append_attempts: 3,
            retry_delay: Duration::from_millis(25),
        }
    }

    /// `AUDIT_STRICT=1` turns contention into 503 instead of fail-open.
    pub fn from_env(service_name: impl Into<String>) -> Self {
        let strict = std::env::var("AUDIT_STRICT").as_deref() == Ok("1");
        Self {
            strict,
            ..Self::new(service_name)
        }
    }
}

#[derive(Clone)]
pub struct AuditWriterState {
    pub store: Arc<dyn ChainStore>,
    /// Fan-out to the `audit_logs` exchange; optional so services without a
    /// broker still keep their chain.
    pub publisher: Option<Arc<EventPublisher>>,
    pub config: Arc<AuditWriterConfig>,
}

/// True for the methods the ledger observes.
fn is_mutating(method: &axum::http::Method) -> bool {
    matches!(
        method.as_str(),
        "POST" | "PUT" | "PATCH" | "DELETE"
    )
}

pub async fn audit_middleware(
    State(state): State<AuditWriterState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if !is_mutating(&method) || is_exempt(&path) {
        return next.run(req).await;
    }
    let Some(context) = req.extensions().get::<TenantContext>().cloned() else {
        // No identity: either the route is exempt or the auth layer is about
        // to reject it. Nothing to attribute the record to.
        return next.run(req).await;
    };

    let (req, request_digest) = buffer_request(req).await;
    let response = next.run(req).await;
    let (response, response_digest) = buffer_response(response).await;

    let draft = RecordDraft {
        user_id: context.user_id(),
        service_name: state.config.service_name.clone(),
        method: method.to_string(),
        path,
        status_code: response.status().as_u16(),
        request_digest,
        response_digest,
        occurred_at: Utc::now(),
    };

    match append_with_retry(&state, context.tenant_id(), draft).await {
        AppendOutcome::Appended => response,
        AppendOutcome::FailedOpen => response,
        AppendOutcome::Contended => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "error": "ledger_contention",
                "message": "audit chain busy; retry the request",
            })),
        )
            .into_response(),
    }
}

enum AppendOutcome {
    Appended,
    /// Writer failed but the request is allowed through.
    FailedOpen,
    /// Strict mode only: contention budget exhausted.
    Contended,
}

async fn append_with_retry(
    state: &AuditWriterState,
    tenant_id: TenantId,
    draft: RecordDraft,
) -> AppendOutcome {
    let mut delay = state.config.retry_delay;

    for attempt in 1..=state.config.append_attempts.max(1) {
        match state.store.append(tenant_id, draft.clone()).await {
            Ok(record) => {
                debug!(
                    tenant_id = %tenant_id,
                    sequence = record.sequence,
                    "audit record appended"
                );
                fan_out(state, tenant_id, &record);
                return AppendOutcome::Appended;
            }
            Err(LedgerError::Contention) if attempt < state.config.append_attempts => {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(LedgerError::Contention) => {
                warn!(tenant_id = %tenant_id, "audit append contended; budget exhausted");
                return if state.config.strict {
                    AppendOutcome::Contended
                } else {
                    AppendOutcome::FailedOpen
                };
            }
            Err(LedgerError::Storage(e)) => {
                // Audit failure must not fail the observed request.
                warn!(tenant_id = %tenant_id, error = %e, "audit append failed; continuing");
                return AppendOutcome::FailedOpen;
            }
        }
    }
    AppendOutcome::FailedOpen
}

/// Fire-and-forget fan-out to the `audit_logs` exchange.
fn fan_out(state: &AuditWriterState, tenant_id: TenantId, record: &crate::record::AuditRecord) {
    let Some(publisher) = state.publisher.clone() else {
        return;
    };
    let routing_key = format!("{}.audit.appended", state.config.service_name);
    let Ok(routing_key) = routing_key.parse() else {
        warn!(service = %state.config.service_name, "service name yields invalid routing key");
        return;
    };
    let event = loomerp_bus::Event::tenant_scoped(routing_key, tenant_id, json!(record));

    // The publisher retries/sleeps internally; keep it off the request task.
    tokio::task::spawn_blocking(move || {
        if let Err(e) = publisher.publish(AUDIT_LOGS_EXCHANGE, &event) {
            warn!(error = %e, "audit fan-out dropped");
        }
    });
}

async fn buffer_request(req: Request<Body>) -> (Request<Body>, String) {
    let (parts, body) = req.into_parts();
    match axum::body::to_bytes(body, MAX_OBSERVED_BODY).await {
        Ok(bytes) => {
            let digest = body_digest(&bytes);
            (Request::from_parts(parts, Body::from(bytes)), digest)
        }
        Err(_) => (
            Request::from_parts(parts, Body::empty()),
            "<body too large to observe>".to_string(),
        ),
    }
}

async fn buffer_response(response: Response) -> (Response, String) {
    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(body, MAX_OBSERVED_BODY).await {
        Ok(bytes) => {
            let digest = body_digest(&bytes);
            (Response::from_parts(parts, Body::from(bytes)), digest)
        }
        Err(_) => (
            Response::from_parts(parts, Body::empty()),
            "<body too large to observe>".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryChainStore;

    fn state(store: Arc<InMemoryChainStore>, strict: bool) -> AuditWriterState {
        AuditWriterState {
            store,
            publisher: None,
            config: Arc::new(AuditWriterConfig {
                service_name: "pos".to_string(),
                strict,
                append_attempts: 2,
                retry_delay: Duration::from_millis(1),
            }),
        }
    }

    fn draft() -> RecordDraft {
        RecordDraft {
            user_id: loomerp_core::UserId::new(),
            service_name: "pos".to_string(),
            method: "POST".to_string(),
            path: "/pos/orders".to_string(),
            status_code: 201,
            request_digest: "{}".to_string(),
            response_digest: "{}".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn mutating_methods_only() {
        use axum::http::Method;
        assert!(is_mutating(&Method::POST));
        assert!(is_mutating(&Method::DELETE));
        assert!(!is_mutating(&Method::GET));
        assert!(!is_mutating(&Method::HEAD));
    }

    #[tokio::test]
    async fn append_retries_then_fails_open() {
        let store = Arc::new(InMemoryChainStore::new());
        let tenant = TenantId::new();
        let _held = store.hold_append_lock(tenant);

        let outcome = append_with_retry(&state(store.clone(), false), tenant, draft()).await;
        assert!(matches!(outcome, AppendOutcome::FailedOpen));
    }

    #[tokio::test]
    async fn strict_mode_surfaces_contention() {
        let store = Arc::new(InMemoryChainStore::new());
        let tenant = TenantId::new();
        let _held = store.hold_append_lock(tenant);

        let outcome = append_with_retry(&state(store.clone(), true), tenant, draft()).await;
        assert!(matches!(outcome, AppendOutcome::Contended));
    }

    #[tokio::test]
    async fn successful_append_extends_chain() {
        let store = Arc::new(InMemoryChainStore::new());
        let tenant = TenantId::new();

        let outcome = append_with_retry(&state(store.clone(), false), tenant, draft()).await;
        assert!(matches!(outcome, AppendOutcome::Appended));
        assert_eq!(store.chain_size(tenant).await.unwrap(), 1);
    }
}
