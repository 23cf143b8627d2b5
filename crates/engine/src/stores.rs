//! Engine storage traits and in-memory implementations.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use loomerp_core::{InstanceId, RuleId, TenantId, WorkflowId};

use crate::instance::WorkflowInstance;
use crate::rule::Rule;
use crate::workflow::Workflow;

pub trait RuleStore: Send + Sync {
    fn save(&self, rule: Rule);

    fn get(&self, tenant_id: TenantId, id: RuleId) -> Option<Rule>;

    /// Active rules listening for this exact routing key.
    fn active_for_trigger(&self, tenant_id: TenantId, trigger_event: &str) -> Vec<Rule>;

    /// Active scheduled rules across all tenants (scheduler tick input).
    fn scheduled(&self) -> Vec<Rule>;

    /// Stamp `last_fired_at`; must never move it backwards.
    fn stamp_fired(&self, tenant_id: TenantId, id: RuleId, at: DateTime<Utc>);

    fn list(&self, tenant_id: TenantId) -> Vec<Rule>;
}

pub trait WorkflowStore: Send + Sync {
    fn save(&self, workflow: Workflow);

    fn get(&self, tenant_id: TenantId, id: WorkflowId) -> Option<Workflow>;

    /// Active workflows whose trigger node matches this routing key.
    fn active_for_trigger(&self, tenant_id: TenantId, trigger_event: &str) -> Vec<Workflow>;

    fn list(&self, tenant_id: TenantId) -> Vec<Workflow>;
}

pub trait InstanceStore: Send + Sync {
    fn save(&self, instance: WorkflowInstance);

    fn get(&self, tenant_id: TenantId, id: InstanceId) -> Option<WorkflowInstance>;

    fn list(&self, tenant_id: TenantId) -> Vec<WorkflowInstance>;
}

#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: Mutex<HashMap<(TenantId, RuleId), Rule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleStore for InMemoryRuleStore {
    fn save(&self, rule: Rule) {
        self.rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((rule.tenant_id, rule.id), rule);
    }

    fn get(&self, tenant_id: TenantId, id: RuleId) -> Option<Rule> {
        self.rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(tenant_id, id))
            .cloned()
    }

    fn active_for_trigger(&self, tenant_id: TenantId, trigger_event: &str) -> Vec<Rule> {
        self.rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.active && r.trigger_event == trigger_event)
            .cloned()
            .collect()
    }

    fn scheduled(&self) -> Vec<Rule> {
        self.rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|r| r.active && r.is_scheduled())
            .cloned()
            .collect()
    }

    fn stamp_fired(&self, tenant_id: TenantId, id: RuleId, at: DateTime<Utc>) {
        let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(rule) = rules.get_mut(&(tenant_id, id)) {
            if rule.last_fired_at.map(|last| at > last).unwrap_or(true) {
                rule.last_fired_at = Some(at);
            }
        }
    }

    fn list(&self, tenant_id: TenantId) -> Vec<Rule> {
        self.rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    workflows: Mutex<HashMap<(TenantId, WorkflowId), Workflow>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    fn save(&self, workflow: Workflow) {
        self.workflows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((workflow.tenant_id, workflow.id), workflow);
    }

    fn get(&self, tenant_id: TenantId, id: WorkflowId) -> Option<Workflow> {
        self.workflows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(tenant_id, id))
            .cloned()
    }

    fn active_for_trigger(&self, tenant_id: TenantId, trigger_event: &str) -> Vec<Workflow> {
        self.workflows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|w| {
                w.tenant_id == tenant_id && w.active && w.trigger_event() == trigger_event
            })
            .cloned()
            .collect()
    }

    fn list(&self, tenant_id: TenantId) -> Vec<Workflow> {
        self.workflows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: Mutex<HashMap<(TenantId, InstanceId), WorkflowInstance>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceStore for InMemoryInstanceStore {
    fn save(&self, instance: WorkflowInstance) {
        self.instances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((instance.tenant_id, instance.id), instance);
    }

    fn get(&self, tenant_id: TenantId, id: InstanceId) -> Option<WorkflowInstance> {
        self.instances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(tenant_id, id))
            .cloned()
    }

    fn list(&self, tenant_id: TenantId) -> Vec<WorkflowInstance> {
        self.instances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}
