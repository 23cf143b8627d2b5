//! Inventory subscriber: stock movements in reaction to sales and purchase
//! receipts, with reply events echoing the originator's correlation key.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, warn};

use loomerp_bus::event::names;
use loomerp_bus::{Event, EventHandler, EventPublisher, HandlerOutcome, EVENTS_EXCHANGE};
use loomerp_core::TenantId;

use crate::stock::{StockError, StockStore};

/// Consumes `pos.sale.closed` (decrement) and `purchase.order.received`
/// (increment). Re-delivery of a processed reference is a no-op.
pub struct InventorySubscriber {
    stock: Arc<dyn StockStore>,
    publisher: Arc<EventPublisher>,
    processed: Mutex<HashSet<(TenantId, String)>>,
}

impl InventorySubscriber {
    pub fn new(stock: Arc<dyn StockStore>, publisher: Arc<EventPublisher>) -> Self {
        Self {
            stock,
            publisher,
            processed: Mutex::new(HashSet::new()),
        }
    }

    fn already_processed(&self, tenant_id: TenantId, reference: &str) -> bool {
        !self
            .processed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((tenant_id, reference.to_string()))
    }

    fn publish(&self, event: Event) {
        if let Err(e) = self.publisher.publish(EVENTS_EXCHANGE, &event) {
            warn!(error = %e, "inventory reply publish failed permanently");
        }
    }

    /// Parse `items: [{sku, qty}]` from an order payload.
    fn parse_lines(event: &Event) -> Option<Vec<(String, i64)>> {
        let items = event.field("items")?.as_array()?;
        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            let sku = item.get("sku")?.as_str()?.to_string();
            let qty = item.get("qty")?.as_i64()?;
            lines.push((sku, qty));
        }
        Some(lines)
    }

    fn on_sale_closed(&self, event: &Event, tenant_id: TenantId, reference: &str) {
        let Some(lines) = Self::parse_lines(event) else {
            warn!(order = %reference, "sale event without parseable items");
            return;
        };

        match self.stock.decrement_all(tenant_id, &lines) {
            Ok(remaining) => {
                debug!(order = %reference, lines = remaining.len(), "stock decremented");
                for (sku, quantity_remaining) in remaining {
                    self.publish(Event::tenant_scoped(
                        names::STOCK_UPDATE_SUCCESS.parse().expect("static key"),
                        tenant_id,
                        json!({
                            "order_reference": reference,
                            "product_id": sku,
                            "quantity_remaining": quantity_remaining,
                        }),
                    ));
                }
            }
            Err(StockError::Insufficient { .. }) => {
                let error = "insufficient stock";
                warn!(order = %reference, error, "stock decrement refused");
                self.publish(Event::tenant_scoped(
                    names::STOCK_UPDATE_FAILED.parse().expect("static key"),
                    tenant_id,
                    json!({
                        "order_reference": reference,
                        "error": error,
                    }),
                ));
            }
        }
    }

    fn on_purchase_received(&self, event: &Event, tenant_id: TenantId, reference: &str) {
        let Some(lines) = Self::parse_lines(event) else {
            warn!(po = %reference, "purchase receipt without parseable items");
            self.publish(Event::tenant_scoped(
                names::STOCK_UPDATE_FAILED.parse().expect("static key"),
                tenant_id,
                json!({
                    "order_reference": reference,
                    "error": "unparseable receipt lines",
                }),
            ));
            return;
        };

        for (sku, qty) in &lines {
            let level = self.stock.increment(tenant_id, sku, *qty);
            self.publish(Event::tenant_scoped(
                names::STOCK_UPDATE_SUCCESS.parse().expect("static key"),
                tenant_id,
                json!({
                    "order_reference": reference,
                    "product_id": sku,
                    "quantity_remaining": level,
                }),
            ));
        }
    }
}

impl EventHandler for InventorySubscriber {
    fn handle(&self, event: &Event) -> HandlerOutcome {
        let Some(tenant_id) = event.tenant_id else {
            return HandlerOutcome::Reject("stock event without tenant_id".to_string());
        };

        match event.routing_key.as_str() {
            names::POS_SALE_CLOSED => {
                let Some(reference) = event.field("order_number").and_then(|v| v.as_str()) else {
                    return HandlerOutcome::Reject("sale without order_number".to_string());
                };
                if self.already_processed(tenant_id, reference) {
                    return HandlerOutcome::Completed;
                }
                self.on_sale_closed(event, tenant_id, reference);
            }
            names::PURCHASE_ORDER_RECEIVED => {
                let Some(reference) = event.field("po_reference").and_then(|v| v.as_str()) else {
                    return HandlerOutcome::Reject("receipt without po_reference".to_string());
                };
                if self.already_processed(tenant_id, reference) {
                    return HandlerOutcome::Completed;
                }
                self.on_purchase_received(event, tenant_id, reference);
            }
            _ => {}
        }
        HandlerOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stock::InMemoryStockStore;
    use loomerp_bus::{Broker, InMemoryBroker};
    use std::time::Duration;

    fn setup() -> (
        InventorySubscriber,
        Arc<InMemoryStockStore>,
        Arc<InMemoryBroker>,
    ) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_exchange(EVENTS_EXCHANGE).unwrap();
        broker.declare_queue("replies").unwrap();
        broker
            .bind("replies", EVENTS_EXCHANGE, &"stock.update.*".parse().unwrap())
            .unwrap();

        let stock = Arc::new(InMemoryStockStore::new());
        let publisher = Arc::new(EventPublisher::new(broker.clone()));
        (
            InventorySubscriber::new(stock.clone(), publisher),
            stock,
            broker,
        )
    }

    fn sale(tenant: TenantId, order: &str, qty: i64) -> Event {
        Event::tenant_scoped(
            names::POS_SALE_CLOSED.parse().unwrap(),
            tenant,
            json!({
                "order_number": order,
                "items": [{"sku": "S", "qty": qty}],
                "grand_total": "200.00",
            }),
        )
    }

    fn next_reply(broker: &InMemoryBroker) -> Event {
        let delivery = broker
            .receive("replies", Duration::from_millis(50))
            .unwrap()
            .expect("expected a reply event");
        broker.ack("replies", delivery.tag).unwrap();
        Event::decode(&delivery.payload).unwrap()
    }

    #[test]
    fn sale_decrements_and_replies_success() {
        let (subscriber, stock, broker) = setup();
        let tenant = TenantId::new();
        stock.set_level(tenant, "S", 9);

        subscriber.handle(&sale(tenant, "O-1", 2));

        assert_eq!(stock.level(tenant, "S"), 7);
        let reply = next_reply(&broker);
        assert_eq!(reply.routing_key.as_str(), names::STOCK_UPDATE_SUCCESS);
        assert_eq!(reply.field("order_reference"), Some(&json!("O-1")));
        assert_eq!(reply.field("quantity_remaining"), Some(&json!(7)));
    }

    #[test]
    fn insufficient_stock_replies_failed_and_moves_nothing() {
        let (subscriber, stock, broker) = setup();
        let tenant = TenantId::new();
        stock.set_level(tenant, "S", 1);

        subscriber.handle(&sale(tenant, "O-1", 2));

        assert_eq!(stock.level(tenant, "S"), 1);
        let reply = next_reply(&broker);
        assert_eq!(reply.routing_key.as_str(), names::STOCK_UPDATE_FAILED);
        assert_eq!(reply.field("error"), Some(&json!("insufficient stock")));
    }

    #[test]
    fn redelivered_sale_is_a_no_op() {
        let (subscriber, stock, broker) = setup();
        let tenant = TenantId::new();
        stock.set_level(tenant, "S", 10);

        let event = sale(tenant, "O-1", 2);
        subscriber.handle(&event);
        subscriber.handle(&event);

        assert_eq!(stock.level(tenant, "S"), 8);
        let _first = next_reply(&broker);
        assert!(broker
            .receive("replies", Duration::from_millis(20))
            .unwrap()
            .is_none());
    }

    #[test]
    fn purchase_receipt_increments() {
        let (subscriber, stock, broker) = setup();
        let tenant = TenantId::new();
        stock.set_level(tenant, "S", 3);

        subscriber.handle(&Event::tenant_scoped(
            names::PURCHASE_ORDER_RECEIVED.parse().unwrap(),
            tenant,
            json!({
                "po_reference": "PO-7",
                "items": [{"sku": "S", "qty": 5}],
            }),
        ));

        assert_eq!(stock.level(tenant, "S"), 8);
        let reply = next_reply(&broker);
        assert_eq!(reply.field("order_reference"), Some(&json!("PO-7")));
    }
}
