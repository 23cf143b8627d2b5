//! Platform event model.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use loomerp_core::{DomainError, TenantId};

/// Routing key of a published event: `.`-delimited segments encoding
/// `<origin>.<aggregate>.<verb>` (e.g. `pos.sale.closed`).
///
/// Concrete keys never contain wildcards; those belong to
/// [`crate::topic::BindingPattern`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl FromStr for RoutingKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split('.').collect();
        if segments.len() < 2 {
            return Err(DomainError::validation(format!(
                "routing key '{s}' needs at least <origin>.<verb>"
            )));
        }
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(DomainError::validation(format!(
                "routing key '{s}' has an empty segment"
            )));
        }
        if segments.iter().any(|seg| *seg == "*" || *seg == "#") {
            return Err(DomainError::validation(format!(
                "routing key '{s}' may not contain wildcards"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl core::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event as it crosses the wire.
///
/// `body` must carry `tenant_id` whenever the event is tenant-scoped; the
/// constructors enforce that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_name: String,
    pub routing_key: RoutingKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub occurred_at: DateTime<Utc>,
    pub body: JsonValue,
}

impl Event {
    /// A tenant-scoped event. `tenant_id` is stamped into the body as well so
    /// subscribers that only see payloads keep the tenant.
    pub fn tenant_scoped(
        routing_key: RoutingKey,
        tenant_id: TenantId,
        mut body: JsonValue,
    ) -> Self {
        if let Some(obj) = body.as_object_mut() {
            obj.entry("tenant_id")
                .or_insert_with(|| serde_json::json!(tenant_id));
        }
        Self {
            event_name: routing_key.as_str().to_string(),
            routing_key,
            tenant_id: Some(tenant_id),
            occurred_at: Utc::now(),
            body,
        }
    }

    /// A platform-global event (no tenant scope).
    pub fn global(routing_key: RoutingKey, body: JsonValue) -> Self {
        Self {
            event_name: routing_key.as_str().to_string(),
            routing_key,
            tenant_id: None,
            occurred_at: Utc::now(),
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Event is a plain serde struct; encoding cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Field lookup in the body (top level only).
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.body.as_object().and_then(|obj| obj.get(name))
    }
}

/// Canonical routing keys published by the platform services.
pub mod names {
    pub const POS_SALE_CLOSED: &str = "pos.sale.closed";
    pub const POS_RETURN_CREATED: &str = "pos.return.created";
    pub const POS_SALE_COMPENSATION_REQUIRED: &str = "pos.sale.compensation_required";
    pub const STOCK_UPDATE_SUCCESS: &str = "stock.update.success";
    pub const STOCK_UPDATE_FAILED: &str = "stock.update.failed";
    pub const PURCHASE_ORDER_RECEIVED: &str = "purchase.order.received";
    pub const PURCHASE_PAYMENT_RECORDED: &str = "purchase.payment.recorded";
    pub const PRODUCTION_QC_REQUESTED: &str = "production.qc_requested";
    pub const PRODUCTION_OUTPUT_CREATED: &str = "production.output_created";
    pub const PRODUCTION_MATERIALS_CONSUMED: &str = "production.materials_consumed";
    pub const QUALITY_INSPECTION_COMPLETED: &str = "quality.inspection.completed";
    pub const HRMS_PAYROLL_FINALIZED: &str = "hrms.payroll.finalized";
    pub const HRMS_SHIFT_ASSIGNED: &str = "hrms.shift.assigned";
    pub const MANUFACTURING_DEFECT_ESCALATION: &str = "manufacturing.defect_escalation";
    pub const INTELLIGENCE_LOW_STOCK_PREDICTED: &str = "intelligence.inventory.low_stock_predicted";
    pub const INTELLIGENCE_MAINTENANCE_REQUESTED: &str = "intelligence.maintenance.requested";
    pub const CUSTOMER_VERIFY_EMAIL: &str = "customer.verify_email";
    pub const CUSTOMER_VERIFY_PHONE: &str = "customer.verify_phone";
}
