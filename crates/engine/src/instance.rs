//! Workflow instances and their single-threaded execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use loomerp_core::{InstanceId, TenantId, WorkflowId};

use crate::action::{ActionError, ActionRunner};
use crate::workflow::{EdgeLabel, NodeKind, Workflow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    PendingApproval,
    Completed,
    Failed,
}

/// A running execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workflow_id: WorkflowId,
    pub tenant_id: TenantId,
    pub state: InstanceState,
    pub current_node_id: Option<String>,
    /// The triggering event body; condition fields and action templates read
    /// from here.
    pub context: JsonValue,
    /// Node ids executed so far, in order.
    pub visited: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create an instance parked on the trigger node.
    pub fn start(workflow: &Workflow, context: JsonValue) -> Self {
        Self {
            id: InstanceId::new(),
            workflow_id: workflow.id,
            tenant_id: workflow.tenant_id,
            state: InstanceState::Running,
            current_node_id: Some(workflow.trigger_node_id().to_string()),
            context,
            visited: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, InstanceState::Completed | InstanceState::Failed)
    }

    /// Advance until the instance completes, fails, or parks on an approval.
    ///
    /// Single-threaded per instance: the caller owns the instance for the
    /// whole run.
    pub fn run(&mut self, workflow: &Workflow, runner: &dyn ActionRunner) {
        while self.state == InstanceState::Running {
            self.step(workflow, runner);
        }
    }

    /// Execute the current node and move `current_node_id`.
    fn step(&mut self, workflow: &Workflow, runner: &dyn ActionRunner) {
        let Some(node_id) = self.current_node_id.clone() else {
            self.finish(InstanceState::Completed);
            return;
        };
        let Some(node) = workflow.node(&node_id) else {
            warn!(instance = %self.id, node = %node_id, "instance points at unknown node");
            self.finish(InstanceState::Failed);
            return;
        };
        self.visited.push(node_id.clone());

        match &node.kind {
            NodeKind::Trigger { .. } => self.follow_single_edge(workflow, &node_id),
            NodeKind::Action { action } => {
                match runner.run(self.tenant_id, action, &self.context) {
                    Ok(()) => self.follow_single_edge(workflow, &node_id),
                    Err(ActionError::Transient(e)) | Err(ActionError::Permanent(e)) => {
                        // Workflow actions run inline; any failure past the
                        // runner's own retries fails the instance.
                        warn!(instance = %self.id, node = %node_id, error = %e, "workflow action failed");
                        self.finish(InstanceState::Failed);
                    }
                }
            }
            NodeKind::Condition { condition } => {
                let branch = condition.evaluate(&self.context);
                let wanted = if branch { EdgeLabel::True } else { EdgeLabel::False };
                let outgoing = workflow.outgoing(&node_id);
                let next = outgoing
                    .iter()
                    .find(|e| e.label == Some(wanted))
                    .or_else(|| outgoing.first())
                    .map(|e| e.target.clone());
                match next {
                    Some(target) => self.current_node_id = Some(target),
                    None => self.finish(InstanceState::Completed),
                }
            }
            NodeKind::Approval { .. } => {
                self.state = InstanceState::PendingApproval;
            }
        }
    }

    /// Resume a parked instance: an external approval moves it to the
    /// approval node's successor.
    pub fn approve(&mut self, workflow: &Workflow, runner: &dyn ActionRunner) -> bool {
        if self.state != InstanceState::PendingApproval {
            return false;
        }
        let Some(node_id) = self.current_node_id.clone() else {
            return false;
        };
        match workflow.outgoing(&node_id).first() {
            Some(edge) => {
                self.current_node_id = Some(edge.target.clone());
                self.state = InstanceState::Running;
                self.run(workflow, runner);
            }
            None => self.finish(InstanceState::Completed),
        }
        true
    }

    fn follow_single_edge(&mut self, workflow: &Workflow, node_id: &str) {
        match workflow.outgoing(node_id).first() {
            Some(edge) => self.current_node_id = Some(edge.target.clone()),
            None => self.finish(InstanceState::Completed),
        }
    }

    fn finish(&mut self, state: InstanceState) {
        self.state = state;
        self.current_node_id = None;
        self.ended_at = Some(Utc::now());
    }
}
