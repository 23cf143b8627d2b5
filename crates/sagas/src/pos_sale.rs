//! POS sale closure saga.
//!
//! POS commits the sale locally and publishes `pos.sale.closed`; inventory
//! replies `stock.update.{success,failed}` echoing the order number. On
//! failure the order flips to `error` with a compensation note — previously
//! posted journals and aggregates are NOT auto-reversed, an operator reviews
//! instead — and an escalation event goes out for alerting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;

use loomerp_bus::event::names;
use loomerp_bus::Event;
use loomerp_core::TenantId;

use crate::saga::{Saga, SagaAction, SagaRecord, SagaState};

/// Stand-in for the POS order table: the saga only needs to flip a status
/// and attach a reason.
pub trait OrderStatusStore: Send + Sync {
    fn set_status(&self, tenant_id: TenantId, reference: &str, status: &str, reason: Option<&str>);

    fn status(&self, tenant_id: TenantId, reference: &str) -> Option<(String, Option<String>)>;
}

#[derive(Debug, Default)]
pub struct InMemoryOrderStatusStore {
    orders: Mutex<HashMap<(TenantId, String), (String, Option<String>)>>,
}

impl InMemoryOrderStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderStatusStore for InMemoryOrderStatusStore {
    fn set_status(&self, tenant_id: TenantId, reference: &str, status: &str, reason: Option<&str>) {
        self.orders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                (tenant_id, reference.to_string()),
                (status.to_string(), reason.map(str::to_string)),
            );
    }

    fn status(&self, tenant_id: TenantId, reference: &str) -> Option<(String, Option<String>)> {
        self.orders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(tenant_id, reference.to_string()))
            .cloned()
    }
}

pub struct PosSaleSaga {
    orders: Arc<dyn OrderStatusStore>,
}

impl PosSaleSaga {
    pub fn new(orders: Arc<dyn OrderStatusStore>) -> Self {
        Self { orders }
    }
}

impl Saga for PosSaleSaga {
    fn saga_type(&self) -> &'static str {
        "saga.pos_sale"
    }

    fn correlate(&self, event: &Event) -> Option<String> {
        match event.routing_key.as_str() {
            names::POS_SALE_CLOSED => event
                .field("order_number")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            names::STOCK_UPDATE_SUCCESS | names::STOCK_UPDATE_FAILED => event
                .field("order_reference")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        }
    }

    fn initiates(&self, event: &Event) -> bool {
        event.routing_key.as_str() == names::POS_SALE_CLOSED
    }

    fn react(&self, record: &SagaRecord, event: &Event) -> Vec<SagaAction> {
        match event.routing_key.as_str() {
            names::POS_SALE_CLOSED => vec![
                SagaAction::RecordStep {
                    step_name: "sale_closed".to_string(),
                    outcome: "ok".to_string(),
                },
                SagaAction::Transition(SagaState::Processing),
            ],
            names::STOCK_UPDATE_SUCCESS => vec![
                SagaAction::RecordStep {
                    step_name: "stock_update".to_string(),
                    outcome: "ok".to_string(),
                },
                SagaAction::Transition(SagaState::Succeeded),
            ],
            names::STOCK_UPDATE_FAILED => {
                if record.has_step("stock_update") {
                    return Vec::new();
                }
                let error = event
                    .field("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("stock update failed");

                // Compensation model: hold the order in `error` for operator
                // review. No automatic refund or journal reversal.
                self.orders.set_status(
                    record.tenant_id,
                    &record.correlation_id,
                    "error",
                    Some(error),
                );

                vec![
                    SagaAction::RecordStep {
                        step_name: "stock_update".to_string(),
                        outcome: format!("failed: {error}"),
                    },
                    SagaAction::RecordStep {
                        step_name: "compensation".to_string(),
                        outcome: "order held in error state; operator review required".to_string(),
                    },
                    SagaAction::Transition(SagaState::Failed),
                    SagaAction::Publish(Event::tenant_scoped(
                        names::POS_SALE_COMPENSATION_REQUIRED
                            .parse()
                            .expect("static key"),
                        record.tenant_id,
                        json!({
                            "order_reference": record.correlation_id,
                            "error": error,
                        }),
                    )),
                ]
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
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        runner: SagaRunner<PosSaleSaga>,
        store: Arc<InMemorySagaStore>,
        orders: Arc<InMemoryOrderStatusStore>,
        broker: Arc<InMemoryBroker>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_exchange(EVENTS_EXCHANGE).unwrap();
        broker.declare_queue("alerts").unwrap();
        broker
            .bind("alerts", EVENTS_EXCHANGE, &"pos.sale.compensation_required".parse().unwrap())
            .unwrap();

        let store = Arc::new(InMemorySagaStore::new());
        let orders = Arc::new(InMemoryOrderStatusStore::new());
        let runner = SagaRunner::new(
            PosSaleSaga::new(orders.clone()),
            store.clone(),
            Arc::new(EventPublisher::new(broker.clone())),
        );
        Fixture {
            runner,
            store,
            orders,
            broker,
        }
    }

    fn sale(tenant: TenantId, order: &str) -> Event {
        Event::tenant_scoped(
            names::POS_SALE_CLOSED.parse().unwrap(),
            tenant,
            json!({"order_number": order, "items": [{"sku": "S", "qty": 2}], "grand_total": "200.00"}),
        )
    }

    fn stock_reply(tenant: TenantId, order: &str, ok: bool) -> Event {
        let key = if ok {
            names::STOCK_UPDATE_SUCCESS
        } else {
            names::STOCK_UPDATE_FAILED
        };
        let mut body = json!({"order_reference": order});
        if !ok {
            body["error"] = json!("insufficient stock");
        }
        Event::tenant_scoped(key.parse().unwrap(), tenant, body)
    }

    #[test]
    fn happy_path_reaches_succeeded() {
        let f = fixture();
        let tenant = TenantId::new();

        f.runner.handle(&sale(tenant, "O-1"));
        f.runner.handle(&stock_reply(tenant, "O-1", true));

        let record = f.store.load("saga.pos_sale", tenant, "O-1").unwrap();
        assert_eq!(record.state, SagaState::Succeeded);
        assert!(record.has_step("sale_closed"));
        assert!(record.has_step("stock_update"));
    }

    #[test]
    fn failure_holds_order_and_escalates() {
        let f = fixture();
        let tenant = TenantId::new();

        f.runner.handle(&sale(tenant, "O-1"));
        f.runner.handle(&stock_reply(tenant, "O-1", false));

        let record = f.store.load("saga.pos_sale", tenant, "O-1").unwrap();
        assert_eq!(record.state, SagaState::Failed);
        assert!(record.has_step("compensation"));

        let (status, reason) = f.orders.status(tenant, "O-1").unwrap();
        assert_eq!(status, "error");
        assert_eq!(reason.as_deref(), Some("insufficient stock"));

        let delivery = f
            .broker
            .receive("alerts", Duration::from_millis(50))
            .unwrap()
            .expect("escalation event");
        let alert = Event::decode(&delivery.payload).unwrap();
        assert_eq!(alert.field("order_reference"), Some(&json!("O-1")));
    }

    #[test]
    fn terminal_state_survives_late_replies() {
        let f = fixture();
        let tenant = TenantId::new();

        f.runner.handle(&sale(tenant, "O-1"));
        f.runner.handle(&stock_reply(tenant, "O-1", true));
        // Late contradictory reply must not overwrite the terminal state.
        f.runner.handle(&stock_reply(tenant, "O-1", false));

        let record = f.store.load("saga.pos_sale", tenant, "O-1").unwrap();
        assert_eq!(record.state, SagaState::Succeeded);
        assert!(f.orders.status(tenant, "O-1").is_none());
    }

    #[test]
    fn unknown_correlation_is_ignored() {
        let f = fixture();
        let tenant = TenantId::new();

        // A stock reply for an order this saga never saw (another service's
        // correlation space).
        f.runner.handle(&stock_reply(tenant, "PO-9", true));
        assert!(f.store.load("saga.pos_sale", tenant, "PO-9").is_none());
    }

    #[test]
    fn redelivered_reply_is_a_no_op() {
        let f = fixture();
        let tenant = TenantId::new();

        f.runner.handle(&sale(tenant, "O-1"));
        f.runner.handle(&stock_reply(tenant, "O-1", true));
        f.runner.handle(&stock_reply(tenant, "O-1", true));

        let record = f.store.load("saga.pos_sale", tenant, "O-1").unwrap();
        assert_eq!(
            record
                .step_log
                .iter()
                .filter(|s| s.step_name == "stock_update")
                .count(),
            1
        );
    }
}
