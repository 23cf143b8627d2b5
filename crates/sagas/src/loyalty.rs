//! Loyalty subscriber: earned points per tenant earn-rate, idempotent per
//! order.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

use loomerp_bus::event::names;
use loomerp_bus::{Event, EventHandler, HandlerOutcome};
use loomerp_core::{Cents, TenantId};

/// Default: one point per whole currency unit spent.
const DEFAULT_EARN_RATE_CENTS: i64 = 100;

/// Accrues customer points from closed sales.
pub struct LoyaltySubscriber {
    /// Cents of spend per point, per tenant (global default applies
    /// otherwise).
    earn_rates: Mutex<HashMap<TenantId, i64>>,
    balances: Mutex<HashMap<(TenantId, String), i64>>,
    processed: Mutex<HashSet<(TenantId, String)>>,
}

impl LoyaltySubscriber {
    pub fn new() -> Self {
        Self {
            earn_rates: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            processed: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_earn_rate(&self, tenant_id: TenantId, cents_per_point: i64) {
        self.earn_rates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(tenant_id, cents_per_point.max(1));
    }

    pub fn balance(&self, tenant_id: TenantId, customer_id: &str) -> i64 {
        *self
            .balances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(tenant_id, customer_id.to_string()))
            .unwrap_or(&0)
    }

    fn earn_rate(&self, tenant_id: TenantId) -> i64 {
        *self
            .earn_rates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&tenant_id)
            .unwrap_or(&DEFAULT_EARN_RATE_CENTS)
    }
}

impl Default for LoyaltySubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for LoyaltySubscriber {
    fn handle(&self, event: &Event) -> HandlerOutcome {
        if event.routing_key.as_str() != names::POS_SALE_CLOSED {
            return HandlerOutcome::Completed;
        }
        let Some(tenant_id) = event.tenant_id else {
            return HandlerOutcome::Reject("sale without tenant_id".to_string());
        };
        let Some(order) = event.field("order_number").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Reject("sale without order_number".to_string());
        };
        // Anonymous sales earn nothing.
        let Some(customer) = event.field("customer_id").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Completed;
        };
        let Some(Ok(total)) = event
            .field("grand_total")
            .and_then(|v| v.as_str())
            .map(Cents::parse)
        else {
            return HandlerOutcome::Reject(format!("sale {order} without a usable grand_total"));
        };

        // Idempotency key is the order number.
        let inserted = self
            .processed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((tenant_id, order.to_string()));
        if !inserted {
            return HandlerOutcome::Completed;
        }

        let points = total.0 / self.earn_rate(tenant_id);
        if points > 0 {
            let mut balances = self.balances.lock().unwrap_or_else(|p| p.into_inner());
            *balances
                .entry((tenant_id, customer.to_string()))
                .or_insert(0) += points;
            debug!(order = %order, customer = %customer, points, "loyalty points earned");
        }
        HandlerOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sale(tenant: TenantId, order: &str, customer: Option<&str>, total: &str) -> Event {
        let mut body = json!({"order_number": order, "grand_total": total});
        if let Some(customer) = customer {
            body["customer_id"] = json!(customer);
        }
        Event::tenant_scoped(names::POS_SALE_CLOSED.parse().unwrap(), tenant, body)
    }

    #[test]
    fn points_follow_tenant_earn_rate() {
        let subscriber = LoyaltySubscriber::new();
        let tenant = TenantId::new();

        subscriber.handle(&sale(tenant, "O-1", Some("C-1"), "200.00"));
        assert_eq!(subscriber.balance(tenant, "C-1"), 200);

        subscriber.set_earn_rate(tenant, 1000); // one point per 10.00
        subscriber.handle(&sale(tenant, "O-2", Some("C-1"), "200.00"));
        assert_eq!(subscriber.balance(tenant, "C-1"), 220);
    }

    #[test]
    fn redelivery_earns_nothing_extra() {
        let subscriber = LoyaltySubscriber::new();
        let tenant = TenantId::new();

        let event = sale(tenant, "O-1", Some("C-1"), "200.00");
        subscriber.handle(&event);
        subscriber.handle(&event);
        assert_eq!(subscriber.balance(tenant, "C-1"), 200);
    }

    #[test]
    fn anonymous_sales_are_fine() {
        let subscriber = LoyaltySubscriber::new();
        let tenant = TenantId::new();
        assert_eq!(
            subscriber.handle(&sale(tenant, "O-1", None, "200.00")),
            HandlerOutcome::Completed
        );
    }
}
