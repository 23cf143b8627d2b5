//! Record of action executions that exhausted their retries.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loomerp_core::{RuleId, TenantId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: Uuid,
    pub tenant_id: TenantId,
    /// Action kind name (`email`, `webhook`, ...).
    pub kind: String,
    /// Rule that queued the action, when one did.
    pub rule_id: Option<RuleId>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl ActionLog {
    pub fn failed(
        tenant_id: TenantId,
        kind: impl Into<String>,
        rule_id: Option<RuleId>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            kind: kind.into(),
            rule_id,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

pub trait ActionLogStore: Send + Sync {
    fn record(&self, entry: ActionLog);

    fn list(&self, tenant_id: TenantId, limit: usize) -> Vec<ActionLog>;
}

#[derive(Debug, Default)]
pub struct InMemoryActionLogStore {
    entries: Mutex<Vec<ActionLog>>,
}

impl InMemoryActionLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActionLogStore for InMemoryActionLogStore {
    fn record(&self, entry: ActionLog) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry);
    }

    fn list(&self, tenant_id: TenantId, limit: usize) -> Vec<ActionLog> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}
