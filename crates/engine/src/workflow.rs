//! Workflow definitions: a validated node/edge graph per tenant.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use loomerp_core::{DomainError, DomainResult, Extensions, TenantId, WorkflowId};

use crate::action::ActionKind;
use crate::condition::Condition;

/// Label on a condition node's outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeLabel {
    True,
    False,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point; matches an incoming routing key.
    Trigger { event: String },
    /// Branch on a condition over the instance context.
    Condition { condition: Condition },
    /// Run a typed action.
    Action { action: ActionKind },
    /// Park the instance until an explicit approval arrives.
    Approval {
        /// Role expected to approve (informational; enforcement is at the
        /// approval endpoint's permission gate).
        #[serde(default)]
        approver_role: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<EdgeLabel>,
}

/// A workflow definition. Construct via [`Workflow::new`], which validates
/// the graph; stored definitions are assumed valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub tenant_id: TenantId,
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Integrator-defined data; opaque to the engine.
    #[serde(default)]
    pub extensions: Extensions,
    pub active: bool,
}

impl Workflow {
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    ) -> DomainResult<Self> {
        let workflow = Self {
            id: WorkflowId::new(),
            tenant_id,
            name: name.into(),
            nodes,
            edges,
            extensions: Extensions::new(),
            active: true,
        };
        workflow.validate()?;
        Ok(workflow)
    }

    /// Graph invariants: exactly one trigger, edges reference known nodes,
    /// the trigger has exactly one outgoing edge, and the graph is acyclic.
    pub fn validate(&self) -> DomainResult<()> {
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        if ids.len() != self.nodes.len() {
            return Err(DomainError::validation("duplicate node ids"));
        }

        let triggers: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Trigger { .. }))
            .collect();
        if triggers.len() != 1 {
            return Err(DomainError::validation(format!(
                "workflow needs exactly one trigger node, found {}",
                triggers.len()
            )));
        }

        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) || !ids.contains(edge.target.as_str()) {
                return Err(DomainError::validation(format!(
                    "edge {} -> {} references unknown node",
                    edge.source, edge.target
                )));
            }
        }

        if self.outgoing(&triggers[0].id).len() != 1 {
            return Err(DomainError::validation(
                "trigger node needs exactly one outgoing edge",
            ));
        }

        if self.has_cycle() {
            return Err(DomainError::validation("workflow graph has a cycle"));
        }

        Ok(())
    }

    /// The routing key of the trigger node.
    pub fn trigger_event(&self) -> &str {
        self.nodes
            .iter()
            .find_map(|n| match &n.kind {
                NodeKind::Trigger { event } => Some(event.as_str()),
                _ => None,
            })
            // Validation guarantees a trigger exists.
            .unwrap_or_default()
    }

    pub fn trigger_node_id(&self) -> &str {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Trigger { .. }))
            .map(|n| n.id.as_str())
            .unwrap_or_default()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    fn has_cycle(&self) -> bool {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }

        // Iterative DFS with three-color marking.
        let mut visited: HashSet<&str> = HashSet::new();
        let mut in_stack: HashSet<&str> = HashSet::new();

        for start in self.nodes.iter().map(|n| n.id.as_str()) {
            if visited.contains(start) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            in_stack.insert(start);
            while let Some((node, edge_index)) = stack.pop() {
                let next = adjacency
                    .get(node)
                    .and_then(|targets| targets.get(edge_index))
                    .copied();
                match next {
                    Some(target) => {
                        stack.push((node, edge_index + 1));
                        if in_stack.contains(target) {
                            return true;
                        }
                        if !visited.contains(target) {
                            in_stack.insert(target);
                            stack.push((target, 0));
                        }
                    }
                    None => {
                        visited.insert(node);
                        in_stack.remove(node);
                    }
                }
            }
        }
        false
    }
}
