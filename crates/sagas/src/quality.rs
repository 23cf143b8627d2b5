//! Manufacturing quality saga: production order → QC request → inspection
//! verdict. PASSED produces output; REJECTED sends the order to rework and
//! escalates for alerting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;

use loomerp_bus::event::names;
use loomerp_bus::Event;
use loomerp_core::TenantId;

use crate::saga::{Saga, SagaAction, SagaRecord, SagaState};

/// Stand-in for the manufacturing service's production order table.
pub trait ProductionOrderStore: Send + Sync {
    fn set_state(&self, tenant_id: TenantId, reference: &str, state: &str, reason: Option<&str>);

    fn state(&self, tenant_id: TenantId, reference: &str) -> Option<(String, Option<String>)>;
}

#[derive(Debug, Default)]
pub struct InMemoryProductionOrderStore {
    orders: Mutex<HashMap<(TenantId, String), (String, Option<String>)>>,
}

impl InMemoryProductionOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProductionOrderStore for InMemoryProductionOrderStore {
    fn set_state(&self, tenant_id: TenantId, reference: &str, state: &str, reason: Option<&str>) {
        self.orders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                (tenant_id, reference.to_string()),
                (state.to_string(), reason.map(str::to_string)),
            );
    }

    fn state(&self, tenant_id: TenantId, reference: &str) -> Option<(String, Option<String>)> {
        self.orders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(tenant_id, reference.to_string()))
            .cloned()
    }
}

pub struct ManufacturingQualitySaga {
    production_orders: Arc<dyn ProductionOrderStore>,
}

impl ManufacturingQualitySaga {
    pub fn new(production_orders: Arc<dyn ProductionOrderStore>) -> Self {
        Self { production_orders }
    }
}

impl Saga for ManufacturingQualitySaga {
    fn saga_type(&self) -> &'static str {
        "saga.manufacturing_quality"
    }

    fn correlate(&self, event: &Event) -> Option<String> {
        match event.routing_key.as_str() {
            names::PRODUCTION_QC_REQUESTED | names::QUALITY_INSPECTION_COMPLETED => event
                .field("production_order")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        }
    }

    fn initiates(&self, event: &Event) -> bool {
        event.routing_key.as_str() == names::PRODUCTION_QC_REQUESTED
    }

    fn react(&self, record: &SagaRecord, event: &Event) -> Vec<SagaAction> {
        match event.routing_key.as_str() {
            names::PRODUCTION_QC_REQUESTED => vec![
                SagaAction::RecordStep {
                    step_name: "qc_requested".to_string(),
                    outcome: "ok".to_string(),
                },
                SagaAction::Transition(SagaState::Processing),
            ],
            names::QUALITY_INSPECTION_COMPLETED => {
                if record.has_step("inspection") {
                    return Vec::new();
                }
                let status = event
                    .field("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                match status {
                    "PASSED" => {
                        self.production_orders.set_state(
                            record.tenant_id,
                            &record.correlation_id,
                            "COMPLETED",
                            None,
                        );
                        vec![
                            SagaAction::RecordStep {
                                step_name: "inspection".to_string(),
                                outcome: "passed".to_string(),
                            },
                            SagaAction::Publish(Event::tenant_scoped(
                                names::PRODUCTION_OUTPUT_CREATED.parse().expect("static key"),
                                record.tenant_id,
                                json!({"production_order": record.correlation_id}),
                            )),
                            SagaAction::Transition(SagaState::Succeeded),
                        ]
                    }
                    "REJECTED" => {
                        let reason = event
                            .field("reason")
                            .and_then(|v| v.as_str())
                            .unwrap_or("inspection rejected");
                        self.production_orders.set_state(
                            record.tenant_id,
                            &record.correlation_id,
                            "REWORK",
                            Some(reason),
                        );
                        vec![
                            SagaAction::RecordStep {
                                step_name: "inspection".to_string(),
                                outcome: format!("rejected: {reason}"),
                            },
                            SagaAction::Publish(Event::tenant_scoped(
                                names::MANUFACTURING_DEFECT_ESCALATION
                                    .parse()
                                    .expect("static key"),
                                record.tenant_id,
                                json!({
                                    "production_order": record.correlation_id,
                                    "reason": reason,
                                }),
                            )),
                            SagaAction::Transition(SagaState::Failed),
                        ]
                    }
                    other => vec![SagaAction::RecordStep {
                        step_name: "inspection".to_string(),
                        outcome: format!("unrecognized verdict '{other}'"),
                    }],
                }
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::{InMemorySagaStore, SagaRunner, SagaStore};
    use loomerp_bus::{Broker, EventHandler, EventPublisher, InMemoryBroker, EVENTS_EXCHANGE};
    use std::time::Duration;

    struct Fixture {
        runner: SagaRunner<ManufacturingQualitySaga>,
        store: Arc<InMemorySagaStore>,
        production_orders: Arc<InMemoryProductionOrderStore>,
        broker: Arc<InMemoryBroker>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_exchange(EVENTS_EXCHANGE).unwrap();
        broker.declare_queue("follow-ups").unwrap();
        broker
            .bind("follow-ups", EVENTS_EXCHANGE, &"production.#".parse().unwrap())
            .unwrap();
        broker
            .bind(
                "follow-ups",
                EVENTS_EXCHANGE,
                &"manufacturing.defect_escalation".parse().unwrap(),
            )
            .unwrap();

        let store = Arc::new(InMemorySagaStore::new());
        let production_orders = Arc::new(InMemoryProductionOrderStore::new());
        let runner = SagaRunner::new(
            ManufacturingQualitySaga::new(production_orders.clone()),
            store.clone(),
            Arc::new(EventPublisher::new(broker.clone())),
        );
        Fixture {
            runner,
            store,
            production_orders,
            broker,
        }
    }

    fn qc_requested(tenant: TenantId, order: &str) -> Event {
        Event::tenant_scoped(
            names::PRODUCTION_QC_REQUESTED.parse().unwrap(),
            tenant,
            json!({"production_order": order}),
        )
    }

    fn inspection(tenant: TenantId, order: &str, status: &str) -> Event {
        Event::tenant_scoped(
            names::QUALITY_INSPECTION_COMPLETED.parse().unwrap(),
            tenant,
            json!({"production_order": order, "status": status, "reason": "surface defects"}),
        )
    }

    fn follow_up(broker: &InMemoryBroker) -> Event {
        let delivery = broker
            .receive("follow-ups", Duration::from_millis(50))
            .unwrap()
            .expect("follow-up event");
        broker.ack("follow-ups", delivery.tag).unwrap();
        Event::decode(&delivery.payload).unwrap()
    }

    #[test]
    fn passed_inspection_creates_output() {
        let f = fixture();
        let tenant = TenantId::new();

        f.runner.handle(&qc_requested(tenant, "MO-3"));
        f.runner.handle(&inspection(tenant, "MO-3", "PASSED"));

        let record = f
            .store
            .load("saga.manufacturing_quality", tenant, "MO-3")
            .unwrap();
        assert_eq!(record.state, SagaState::Succeeded);
        assert_eq!(
            f.production_orders.state(tenant, "MO-3").unwrap().0,
            "COMPLETED"
        );

        let event = follow_up(&f.broker);
        assert_eq!(event.routing_key.as_str(), names::PRODUCTION_OUTPUT_CREATED);
    }

    #[test]
    fn rejected_inspection_sends_to_rework_and_escalates() {
        let f = fixture();
        let tenant = TenantId::new();

        f.runner.handle(&qc_requested(tenant, "MO-3"));
        f.runner.handle(&inspection(tenant, "MO-3", "REJECTED"));

        let record = f
            .store
            .load("saga.manufacturing_quality", tenant, "MO-3")
            .unwrap();
        assert_eq!(record.state, SagaState::Failed);

        let (state, reason) = f.production_orders.state(tenant, "MO-3").unwrap();
        assert_eq!(state, "REWORK");
        assert_eq!(reason.as_deref(), Some("surface defects"));

        let event = follow_up(&f.broker);
        assert_eq!(
            event.routing_key.as_str(),
            names::MANUFACTURING_DEFECT_ESCALATION
        );
    }
}
