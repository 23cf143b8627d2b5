//! The production [`ActionRunner`]: mail, webhooks, and typed downstream
//! calls through the service registry.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tracing::warn;

use loomerp_core::{Cents, TenantId};
use loomerp_registry::{DownstreamError, ServiceClient, ServiceRegistry};

use crate::action::{render_template, ActionError, ActionKind, ActionRunner};

/// Webhook calls get a longer leash than service-to-service calls.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const WEBHOOK_ATTEMPTS: u32 = 3;

/// A composed mail ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Tenant mail transport boundary. The notification service does actual
/// delivery; dev and tests observe messages in memory.
pub trait MailTransport: Send + Sync {
    fn send(&self, tenant_id: TenantId, message: MailMessage) -> Result<(), ActionError>;
}

/// Collects sent mail for inspection.
#[derive(Debug, Default)]
pub struct InMemoryMailTransport {
    sent: Mutex<Vec<(TenantId, MailMessage)>>,
}

impl InMemoryMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(TenantId, MailMessage)> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl MailTransport for InMemoryMailTransport {
    fn send(&self, tenant_id: TenantId, message: MailMessage) -> Result<(), ActionError> {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((tenant_id, message));
        Ok(())
    }
}

/// Per-tenant mail settings with a process-global fallback.
#[derive(Debug)]
pub struct MailSettings {
    global_from: String,
    per_tenant: Mutex<HashMap<TenantId, String>>,
}

impl MailSettings {
    pub fn new(global_from: impl Into<String>) -> Self {
        Self {
            global_from: global_from.into(),
            per_tenant: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_tenant_from(&self, tenant_id: TenantId, from: impl Into<String>) {
        self.per_tenant
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(tenant_id, from.into());
    }

    pub fn from_address(&self, tenant_id: TenantId) -> String {
        self.per_tenant
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&tenant_id)
            .cloned()
            .unwrap_or_else(|| self.global_from.clone())
    }
}

impl Default for MailSettings {
    fn default() -> Self {
        Self::new("no-reply@platform.local")
    }
}

/// Runs actions against the real world. Each run is a pure function of
/// `(action, context)` — all state lives downstream.
pub struct PlatformActionRunner<M: MailTransport> {
    registry: &'static ServiceRegistry,
    mail: M,
    mail_settings: MailSettings,
    /// Built lazily on the first webhook, which runs on a worker thread —
    /// blocking clients must not be constructed on an async runtime.
    webhook_client: OnceLock<reqwest::blocking::Client>,
}

impl<M: MailTransport> PlatformActionRunner<M> {
    pub fn new(registry: &'static ServiceRegistry, mail: M, mail_settings: MailSettings) -> Self {
        Self {
            registry,
            mail,
            mail_settings,
            webhook_client: OnceLock::new(),
        }
    }

    fn webhook_client(&self) -> &reqwest::blocking::Client {
        self.webhook_client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_default()
        })
    }

    fn run_webhook(
        &self,
        url: &str,
        headers: &std::collections::BTreeMap<String, String>,
        context: &JsonValue,
    ) -> Result<(), ActionError> {
        let mut last_error = String::new();
        for attempt in 1..=WEBHOOK_ATTEMPTS {
            let mut request = self.webhook_client().post(url).json(context);
            for (name, value) in headers {
                request = request.header(name, value);
            }
            match request.send() {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if response.status().is_server_error() => {
                    last_error = format!("webhook returned {}", response.status());
                }
                Ok(response) => {
                    // 4xx will not improve with retries.
                    return Err(ActionError::Permanent(format!(
                        "webhook returned {}",
                        response.status()
                    )));
                }
                Err(e) if e.is_timeout() => last_error = "webhook timed out".to_string(),
                Err(e) => last_error = format!("webhook transport: {e}"),
            }
            if attempt < WEBHOOK_ATTEMPTS {
                std::thread::sleep(Duration::from_millis(100 << attempt));
            }
        }
        Err(ActionError::Transient(last_error))
    }

    fn service_call(&self, service: &str, path: &str, body: JsonValue) -> Result<(), ActionError> {
        let client = ServiceClient::new(self.registry, service).map_err(map_downstream)?;
        client
            .post_json(path, &body, None)
            .map(|_| ())
            .map_err(map_downstream)
    }
}

fn map_downstream(e: DownstreamError) -> ActionError {
    if e.is_transient() {
        ActionError::Transient(e.to_string())
    } else {
        ActionError::Permanent(e.to_string())
    }
}

/// Pull a required field out of the action context.
fn context_field<'a>(context: &'a JsonValue, field: &str) -> Result<&'a JsonValue, ActionError> {
    context
        .as_object()
        .and_then(|obj| obj.get(field))
        .ok_or_else(|| ActionError::Permanent(format!("context is missing '{field}'")))
}

/// Amounts arrive as decimal strings or numbers; normalize to cents.
fn context_amount(context: &JsonValue, field: &str) -> Result<Cents, ActionError> {
    let value = context_field(context, field)?;
    let text = match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        other => {
            return Err(ActionError::Permanent(format!(
                "'{field}' is not an amount: {other}"
            )))
        }
    };
    Cents::parse(&text).map_err(|e| ActionError::Permanent(e.to_string()))
}

impl<M: MailTransport> ActionRunner for PlatformActionRunner<M> {
    fn run(
        &self,
        tenant_id: TenantId,
        action: &ActionKind,
        context: &JsonValue,
    ) -> Result<(), ActionError> {
        match action {
            ActionKind::Email { to, subject, body } => {
                let message = MailMessage {
                    from: self.mail_settings.from_address(tenant_id),
                    to: render_template(to, context),
                    subject: render_template(subject, context),
                    body: render_template(body, context),
                };
                self.mail.send(tenant_id, message)
            }
            ActionKind::Webhook { url, headers } => self.run_webhook(url, headers, context),
            ActionKind::Log { message } => {
                warn!(tenant_id = %tenant_id, message = %render_template(message, context), "rule action");
                Ok(())
            }
            ActionKind::RaiseRfq {
                product_field,
                quantity,
            } => {
                let product = context_field(context, product_field)?.clone();
                self.service_call(
                    "purchase",
                    "/rfqs",
                    json!({
                        "tenant_id": tenant_id,
                        "product_id": product,
                        "quantity": quantity,
                    }),
                )
            }
            ActionKind::CreateJournal {
                debit_account,
                credit_account,
                amount_field,
                description,
            } => {
                let amount = context_amount(context, amount_field)?;
                self.service_call(
                    "accounting",
                    "/journal",
                    json!({
                        "tenant_id": tenant_id,
                        "description": description,
                        "lines": [
                            {"account": debit_account, "amount": amount.to_string(), "side": "debit"},
                            {"account": credit_account, "amount": amount.to_string(), "side": "credit"},
                        ],
                    }),
                )
            }
            ActionKind::CreateProductionJob {
                product_field,
                quantity_field,
            } => {
                let product = context_field(context, product_field)?.clone();
                let quantity = context_field(context, quantity_field)?.clone();
                self.service_call(
                    "manufacturing",
                    "/production-jobs",
                    json!({
                        "tenant_id": tenant_id,
                        "product_id": product,
                        "quantity": quantity,
                    }),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mail_uses_tenant_settings_with_global_fallback() {
        let settings = MailSettings::new("global@platform.local");
        let tenant = TenantId::new();
        let other = TenantId::new();
        settings.set_tenant_from(tenant, "sales@acme.example");

        assert_eq!(settings.from_address(tenant), "sales@acme.example");
        assert_eq!(settings.from_address(other), "global@platform.local");
    }

    #[test]
    fn context_amount_accepts_strings_and_numbers() {
        let context = json!({"grand_total": "200.00", "count": 3});
        assert_eq!(context_amount(&context, "grand_total").unwrap(), Cents(20000));
        assert_eq!(context_amount(&context, "count").unwrap(), Cents(300));
        assert!(context_amount(&context, "missing").is_err());
    }

    #[test]
    fn missing_context_field_is_permanent() {
        let err = context_field(&json!({"a": 1}), "product_id").unwrap_err();
        assert!(matches!(err, ActionError::Permanent(_)));
    }
}
