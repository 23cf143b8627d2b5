//! Purchase receipt saga: PO received → inventory increment; on failure the
//! PO is cancelled with the reason. Idempotency key is the PO reference.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use loomerp_bus::event::names;
use loomerp_bus::Event;
use loomerp_core::TenantId;

use crate::saga::{Saga, SagaAction, SagaRecord, SagaState};

/// Stand-in for the purchase service's PO table.
pub trait PoStatusStore: Send + Sync {
    fn set_status(&self, tenant_id: TenantId, reference: &str, status: &str, reason: Option<&str>);

    fn status(&self, tenant_id: TenantId, reference: &str) -> Option<(String, Option<String>)>;
}

#[derive(Debug, Default)]
pub struct InMemoryPoStatusStore {
    orders: Mutex<HashMap<(TenantId, String), (String, Option<String>)>>,
}

impl InMemoryPoStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoStatusStore for InMemoryPoStatusStore {
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

pub struct PurchaseReceiptSaga {
    purchase_orders: Arc<dyn PoStatusStore>,
}

impl PurchaseReceiptSaga {
    pub fn new(purchase_orders: Arc<dyn PoStatusStore>) -> Self {
        Self { purchase_orders }
    }
}

impl Saga for PurchaseReceiptSaga {
    fn saga_type(&self) -> &'static str {
        "saga.purchase_receipt"
    }

    fn correlate(&self, event: &Event) -> Option<String> {
        match event.routing_key.as_str() {
            names::PURCHASE_ORDER_RECEIVED => event
                .field("po_reference")
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
        event.routing_key.as_str() == names::PURCHASE_ORDER_RECEIVED
    }

    fn react(&self, record: &SagaRecord, event: &Event) -> Vec<SagaAction> {
        match event.routing_key.as_str() {
            names::PURCHASE_ORDER_RECEIVED => vec![
                SagaAction::RecordStep {
                    step_name: "po_received".to_string(),
                    outcome: "ok".to_string(),
                },
                SagaAction::Transition(SagaState::Processing),
            ],
            names::STOCK_UPDATE_SUCCESS => {
                if record.has_step("inventory_increment") {
                    return Vec::new();
                }
                self.purchase_orders.set_status(
                    record.tenant_id,
                    &record.correlation_id,
                    "received",
                    None,
                );
                vec![
                    SagaAction::RecordStep {
                        step_name: "inventory_increment".to_string(),
                        outcome: "ok".to_string(),
                    },
                    SagaAction::Transition(SagaState::Succeeded),
                ]
            }
            names::STOCK_UPDATE_FAILED => {
                if record.has_step("inventory_increment") {
                    return Vec::new();
                }
                let error = event
                    .field("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("inventory increment failed");
                self.purchase_orders.set_status(
                    record.tenant_id,
                    &record.correlation_id,
                    "cancelled",
                    Some(error),
                );
                vec![
                    SagaAction::RecordStep {
                        step_name: "inventory_increment".to_string(),
                        outcome: format!("failed: {error}"),
                    },
                    SagaAction::Transition(SagaState::Failed),
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

    fn fixture() -> (
        SagaRunner<PurchaseReceiptSaga>,
        Arc<InMemorySagaStore>,
        Arc<InMemoryPoStatusStore>,
    ) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_exchange(EVENTS_EXCHANGE).unwrap();
        let store = Arc::new(InMemorySagaStore::new());
        let purchase_orders = Arc::new(InMemoryPoStatusStore::new());
        let runner = SagaRunner::new(
            PurchaseReceiptSaga::new(purchase_orders.clone()),
            store.clone(),
            Arc::new(EventPublisher::new(broker)),
        );
        (runner, store, purchase_orders)
    }

    fn received(tenant: TenantId, po: &str) -> Event {
        Event::tenant_scoped(
            names::PURCHASE_ORDER_RECEIVED.parse().unwrap(),
            tenant,
            json!({"po_reference": po, "items": [{"sku": "S", "qty": 5}]}),
        )
    }

    fn reply(tenant: TenantId, po: &str, ok: bool) -> Event {
        let key = if ok {
            names::STOCK_UPDATE_SUCCESS
        } else {
            names::STOCK_UPDATE_FAILED
        };
        let mut body = json!({"order_reference": po});
        if !ok {
            body["error"] = json!("warehouse offline");
        }
        Event::tenant_scoped(key.parse().unwrap(), tenant, body)
    }

    #[test]
    fn receipt_then_increment_succeeds() {
        let (runner, store, purchase_orders) = fixture();
        let tenant = TenantId::new();

        runner.handle(&received(tenant, "PO-7"));
        runner.handle(&reply(tenant, "PO-7", true));

        let record = store.load("saga.purchase_receipt", tenant, "PO-7").unwrap();
        assert_eq!(record.state, SagaState::Succeeded);
        assert_eq!(
            purchase_orders.status(tenant, "PO-7").unwrap().0,
            "received"
        );
    }

    #[test]
    fn failure_cancels_po_with_reason() {
        let (runner, store, purchase_orders) = fixture();
        let tenant = TenantId::new();

        runner.handle(&received(tenant, "PO-7"));
        runner.handle(&reply(tenant, "PO-7", false));

        let record = store.load("saga.purchase_receipt", tenant, "PO-7").unwrap();
        assert_eq!(record.state, SagaState::Failed);

        let (status, reason) = purchase_orders.status(tenant, "PO-7").unwrap();
        assert_eq!(status, "cancelled");
        assert_eq!(reason.as_deref(), Some("warehouse offline"));
    }

    #[test]
    fn pos_order_replies_do_not_touch_purchase_sagas() {
        let (runner, store, _) = fixture();
        let tenant = TenantId::new();

        runner.handle(&reply(tenant, "O-1", true));
        assert!(store.load("saga.purchase_receipt", tenant, "O-1").is_none());
    }
}
