//! Reporting subscriber: per-day sales aggregates with idempotent merge.
//!
//! Aggregates are recomputed only from explicit events (never from hidden
//! save-hooks), and merging the same order twice is a no-op, so replays and
//! redeliveries cannot inflate the numbers.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use loomerp_bus::event::names;
use loomerp_bus::{Event, EventHandler, HandlerOutcome};
use loomerp_core::{Cents, TenantId};

/// One tenant-day of sales.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyAggregate {
    pub revenue: Cents,
    pub transaction_count: u64,
    /// Units sold per product.
    pub product_counts: HashMap<String, i64>,
}

pub struct ReportingSubscriber {
    days: Mutex<HashMap<(TenantId, NaiveDate), DailyAggregate>>,
    merged: Mutex<HashSet<(TenantId, String)>>,
}

impl ReportingSubscriber {
    pub fn new() -> Self {
        Self {
            days: Mutex::new(HashMap::new()),
            merged: Mutex::new(HashSet::new()),
        }
    }

    pub fn daily(&self, tenant_id: TenantId, date: NaiveDate) -> DailyAggregate {
        self.days
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(tenant_id, date))
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for ReportingSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for ReportingSubscriber {
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
        let Some(Ok(total)) = event
            .field("grand_total")
            .and_then(|v| v.as_str())
            .map(Cents::parse)
        else {
            return HandlerOutcome::Reject(format!("sale {order} without a usable grand_total"));
        };

        // Idempotent merge: one order contributes exactly once.
        let inserted = self
            .merged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((tenant_id, order.to_string()));
        if !inserted {
            return HandlerOutcome::Completed;
        }

        let date = event.occurred_at.date_naive();
        let mut days = self.days.lock().unwrap_or_else(|p| p.into_inner());
        let aggregate = days.entry((tenant_id, date)).or_default();
        aggregate.revenue = aggregate
            .revenue
            .checked_add(total)
            .unwrap_or(aggregate.revenue);
        aggregate.transaction_count += 1;
        if let Some(items) = event.field("items").and_then(|v| v.as_array()) {
            for item in items {
                let (Some(sku), Some(qty)) = (
                    item.get("sku").and_then(|v| v.as_str()),
                    item.get("qty").and_then(|v| v.as_i64()),
                ) else {
                    continue;
                };
                *aggregate.product_counts.entry(sku.to_string()).or_insert(0) += qty;
            }
        }
        debug!(order = %order, date = %date, "daily aggregate merged");
        HandlerOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn sale(tenant: TenantId, order: &str, total: &str) -> Event {
        Event::tenant_scoped(
            names::POS_SALE_CLOSED.parse().unwrap(),
            tenant,
            json!({
                "order_number": order,
                "grand_total": total,
                "items": [{"sku": "S", "qty": 2}],
            }),
        )
    }

    #[test]
    fn sales_accumulate_per_day() {
        let subscriber = ReportingSubscriber::new();
        let tenant = TenantId::new();
        let today = Utc::now().date_naive();

        subscriber.handle(&sale(tenant, "O-1", "200.00"));
        subscriber.handle(&sale(tenant, "O-2", "50.00"));

        let aggregate = subscriber.daily(tenant, today);
        assert_eq!(aggregate.revenue, Cents(25000));
        assert_eq!(aggregate.transaction_count, 2);
        assert_eq!(aggregate.product_counts.get("S"), Some(&4));
    }

    #[test]
    fn redelivered_order_is_zero_net_change() {
        let subscriber = ReportingSubscriber::new();
        let tenant = TenantId::new();
        let today = Utc::now().date_naive();

        let event = sale(tenant, "O-1", "200.00");
        subscriber.handle(&event);
        let before = subscriber.daily(tenant, today);
        subscriber.handle(&event);
        let after = subscriber.daily(tenant, today);

        assert_eq!(before, after);
    }

    #[test]
    fn tenants_do_not_mix() {
        let subscriber = ReportingSubscriber::new();
        let a = TenantId::new();
        let b = TenantId::new();
        let today = Utc::now().date_naive();

        subscriber.handle(&sale(a, "O-1", "200.00"));

        assert_eq!(subscriber.daily(a, today).transaction_count, 1);
        assert_eq!(subscriber.daily(b, today).transaction_count, 0);
    }
}
