//! Typed action kinds.
//!
//! Action kinds are a closed sum: each variant carries its own typed config,
//! the executor switches on the variant, and an unknown kind cannot exist
//! past deserialization. Execution itself is behind [`ActionRunner`] so
//! evaluation stays pure and tests can observe prepared actions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use loomerp_core::TenantId;

/// A tenant-configured action, ready to run against an event context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Compose subject/body from templates and submit to the tenant's mail
    /// transport.
    Email {
        to: String,
        subject: String,
        body: String,
    },
    /// POST the action context as JSON to a configured URL.
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Record to the service log at WARNING.
    Log { message: String },
    /// Raise a request-for-quote at the purchase service.
    RaiseRfq {
        /// Context field holding the product; defaults to `product_id`.
        #[serde(default = "default_product_field")]
        product_field: String,
        quantity: u32,
    },
    /// Post a balanced double-entry journal to the accounting service.
    CreateJournal {
        debit_account: String,
        credit_account: String,
        /// Context field holding the amount; defaults to `amount`.
        #[serde(default = "default_amount_field")]
        amount_field: String,
        #[serde(default)]
        description: Option<String>,
    },
    /// Post a production-job intent to the manufacturing service.
    CreateProductionJob {
        #[serde(default = "default_product_field")]
        product_field: String,
        #[serde(default = "default_quantity_field")]
        quantity_field: String,
    },
}

fn default_product_field() -> String {
    "product_id".to_string()
}

fn default_amount_field() -> String {
    "amount".to_string()
}

fn default_quantity_field() -> String {
    "quantity".to_string()
}

impl ActionKind {
    /// Stable name for logs and the action log.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Email { .. } => "email",
            ActionKind::Webhook { .. } => "webhook",
            ActionKind::Log { .. } => "log",
            ActionKind::RaiseRfq { .. } => "raise_rfq",
            ActionKind::CreateJournal { .. } => "create_journal",
            ActionKind::CreateProductionJob { .. } => "create_production_job",
        }
    }
}

/// Action execution failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Worth retrying (downstream 5xx, timeout, transport).
    #[error("transient action failure: {0}")]
    Transient(String),

    /// Retrying cannot help (bad config, missing context field, 4xx).
    #[error("permanent action failure: {0}")]
    Permanent(String),
}

/// Executes one action against its context. Implementations do the IO;
/// each action run is a pure function of `(action, context)`.
pub trait ActionRunner: Send + Sync {
    fn run(
        &self,
        tenant_id: TenantId,
        action: &ActionKind,
        context: &JsonValue,
    ) -> Result<(), ActionError>;
}

/// Substitute `{{key}}` placeholders from the context's top-level fields.
/// Unknown keys are left in place so misconfigurations stay visible.
pub fn render_template(template: &str, context: &JsonValue) -> String {
    let Some(fields) = context.as_object() else {
        return template.to_string();
    };
    let mut out = template.to_string();
    for (key, value) in fields {
        let needle = format!("{{{{{key}}}}}");
        if out.contains(&needle) {
            let rendered = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&needle, &rendered);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_serialization() {
        let action = ActionKind::RaiseRfq {
            product_field: "product_id".to_string(),
            quantity: 100,
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["kind"], "raise_rfq");
        assert_eq!(value["quantity"], 100);
    }

    #[test]
    fn unknown_kind_fails_to_deserialize() {
        let result: Result<ActionKind, _> =
            serde_json::from_value(json!({"kind": "teleport", "where": "moon"}));
        assert!(result.is_err());
    }

    #[test]
    fn defaulted_config_fields() {
        let action: ActionKind = serde_json::from_value(json!({
            "kind": "create_journal",
            "debit_account": "1000",
            "credit_account": "4000",
        }))
        .unwrap();
        match action {
            ActionKind::CreateJournal { amount_field, .. } => assert_eq!(amount_field, "amount"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn template_rendering() {
        let context = json!({"order_number": "O-1", "grand_total": 200});
        assert_eq!(
            render_template("Order {{order_number}} for {{grand_total}}", &context),
            "Order O-1 for 200"
        );
        assert_eq!(
            render_template("missing {{nope}}", &context),
            "missing {{nope}}"
        );
    }
}
