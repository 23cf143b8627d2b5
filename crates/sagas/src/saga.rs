//! Saga mechanics: records, stores, and the runner that binds a saga to the
//! consumer runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use loomerp_bus::{Event, EventHandler, EventPublisher, HandlerOutcome, EVENTS_EXCHANGE};
use loomerp_core::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Pending,
    Processing,
    Succeeded,
    /// Failed or compensated; which one is in the step log.
    Failed,
}

impl SagaState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Succeeded | SagaState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStep {
    pub step_name: String,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

/// One saga instance, identified by `(saga_type, tenant, correlation_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_type: String,
    pub tenant_id: TenantId,
    /// Originator-chosen (e.g. an order number); echoed by every reply.
    pub correlation_id: String,
    pub state: SagaState,
    pub step_log: Vec<SagaStep>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    pub fn new(saga_type: impl Into<String>, tenant_id: TenantId, correlation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            saga_type: saga_type.into(),
            tenant_id,
            correlation_id: correlation_id.into(),
            state: SagaState::Pending,
            step_log: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn has_step(&self, step_name: &str) -> bool {
        self.step_log.iter().any(|s| s.step_name == step_name)
    }

    /// Append a step; duplicate step names are refused (idempotency key is
    /// `(correlation_id, step_name)`).
    pub fn record_step(&mut self, step_name: impl Into<String>, outcome: impl Into<String>) -> bool {
        let step_name = step_name.into();
        if self.has_step(&step_name) {
            return false;
        }
        self.step_log.push(SagaStep {
            step_name,
            outcome: outcome.into(),
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
        true
    }

    /// Transition state. Terminal states are sticky: late replies cannot
    /// overwrite them.
    pub fn transition(&mut self, state: SagaState) -> bool {
        if self.state.is_terminal() {
            warn!(
                saga = %self.saga_type,
                correlation_id = %self.correlation_id,
                current = ?self.state,
                refused = ?state,
                "refusing transition out of terminal state"
            );
            return false;
        }
        self.state = state;
        self.updated_at = Utc::now();
        true
    }
}

pub trait SagaStore: Send + Sync {
    fn load(&self, saga_type: &str, tenant_id: TenantId, correlation_id: &str)
        -> Option<SagaRecord>;

    fn save(&self, record: SagaRecord);

    fn list(&self, saga_type: &str, tenant_id: TenantId) -> Vec<SagaRecord>;
}

#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    records: Mutex<HashMap<(String, TenantId, String), SagaRecord>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SagaStore for InMemorySagaStore {
    fn load(
        &self,
        saga_type: &str,
        tenant_id: TenantId,
        correlation_id: &str,
    ) -> Option<SagaRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(saga_type.to_string(), tenant_id, correlation_id.to_string()))
            .cloned()
    }

    fn save(&self, record: SagaRecord) {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).insert(
            (
                record.saga_type.clone(),
                record.tenant_id,
                record.correlation_id.clone(),
            ),
            record,
        );
    }

    fn list(&self, saga_type: &str, tenant_id: TenantId) -> Vec<SagaRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|r| r.saga_type == saga_type && r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

/// What a saga wants done in response to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaAction {
    /// Append to the step log. A duplicate step aborts the remaining actions
    /// for this event — the reaction already happened.
    RecordStep { step_name: String, outcome: String },
    /// Move the saga state (terminal states stay sticky).
    Transition(SagaState),
    /// Publish a follow-up event on the `events` exchange.
    Publish(Event),
}

/// A saga definition: correlation plus reactions.
pub trait Saga: Send + Sync {
    fn saga_type(&self) -> &'static str;

    /// Extract this saga's correlation id from an event it cares about.
    fn correlate(&self, event: &Event) -> Option<String>;

    /// Whether this event starts a new saga instance (vs. a reply that must
    /// find an existing record — replies to sagas other than ours share
    /// routing keys, so an unknown correlation is simply not ours).
    fn initiates(&self, event: &Event) -> bool;

    /// Decide what to do. The runner applies the returned actions; a saga
    /// that touches its own aggregate state in here must guard on the step
    /// log so redelivery stays a no-op.
    fn react(&self, record: &SagaRecord, event: &Event) -> Vec<SagaAction>;
}

/// Binds a [`Saga`] to the consumer runtime and applies its actions.
pub struct SagaRunner<S: Saga> {
    saga: S,
    store: Arc<dyn SagaStore>,
    publisher: Arc<EventPublisher>,
}

impl<S: Saga> SagaRunner<S> {
    pub fn new(saga: S, store: Arc<dyn SagaStore>, publisher: Arc<EventPublisher>) -> Self {
        Self {
            saga,
            store,
            publisher,
        }
    }
}

impl<S: Saga> EventHandler for SagaRunner<S> {
    fn handle(&self, event: &Event) -> HandlerOutcome {
        let Some(correlation_id) = self.saga.correlate(event) else {
            return HandlerOutcome::Completed;
        };
        let Some(tenant_id) = event.tenant_id else {
            return HandlerOutcome::Reject("saga event without tenant_id".to_string());
        };

        let saga_type = self.saga.saga_type();
        let mut record = match self.store.load(saga_type, tenant_id, &correlation_id) {
            Some(record) => record,
            None if self.saga.initiates(event) => {
                SagaRecord::new(saga_type, tenant_id, correlation_id.clone())
            }
            None => {
                // A reply for a correlation we never started — another
                // saga's traffic on a shared routing key.
                return HandlerOutcome::Completed;
            }
        };

        if record.state.is_terminal() {
            debug!(
                saga = saga_type,
                correlation_id = %correlation_id,
                "saga already terminal; dropping late event"
            );
            return HandlerOutcome::Completed;
        }

        for action in self.saga.react(&record, event) {
            match action {
                SagaAction::RecordStep { step_name, outcome } => {
                    if !record.record_step(step_name, outcome) {
                        // Redelivery: this reaction already ran.
                        break;
                    }
                }
                SagaAction::Transition(state) => {
                    record.transition(state);
                }
                SagaAction::Publish(follow_up) => {
                    if let Err(e) = self.publisher.publish(EVENTS_EXCHANGE, &follow_up) {
                        warn!(error = %e, "saga follow-up publish failed permanently");
                    }
                }
            }
        }

        self.store.save(record);
        HandlerOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_steps_are_refused() {
        let mut record = SagaRecord::new("saga.pos_sale", TenantId::new(), "O-1");
        assert!(record.record_step("stock_update", "ok"));
        assert!(!record.record_step("stock_update", "ok"));
        assert_eq!(record.step_log.len(), 1);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut record = SagaRecord::new("saga.pos_sale", TenantId::new(), "O-1");
        assert!(record.transition(SagaState::Processing));
        assert!(record.transition(SagaState::Succeeded));
        assert!(!record.transition(SagaState::Failed));
        assert_eq!(record.state, SagaState::Succeeded);
    }

    #[test]
    fn store_is_scoped_by_type_tenant_and_correlation() {
        let store = InMemorySagaStore::new();
        let tenant = TenantId::new();
        store.save(SagaRecord::new("saga.pos_sale", tenant, "O-1"));

        assert!(store.load("saga.pos_sale", tenant, "O-1").is_some());
        assert!(store.load("saga.pos_sale", tenant, "O-2").is_none());
        assert!(store.load("saga.purchase_receipt", tenant, "O-1").is_none());
        assert!(store.load("saga.pos_sale", TenantId::new(), "O-1").is_none());
    }
}
