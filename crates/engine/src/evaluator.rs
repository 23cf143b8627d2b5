//! Event-arrival evaluation: rules fire into the job queue, workflows spawn
//! instances.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use loomerp_bus::{Event, EventHandler, HandlerOutcome};
use loomerp_core::{DomainError, DomainResult, InstanceId, TenantId};

use crate::action::ActionRunner;
use crate::instance::{InstanceState, WorkflowInstance};
use crate::jobs::{ActionJob, ActionJobStore};
use crate::stores::{InstanceStore, RuleStore, WorkflowStore};

/// Evaluates incoming events against tenant rules and workflows.
///
/// Rule evaluation is pure: the same event against the same rules queues the
/// same set of actions. Side effects are confined to the job queue and the
/// `last_fired_at` stamp.
pub struct Evaluator {
    rules: Arc<dyn RuleStore>,
    workflows: Arc<dyn WorkflowStore>,
    instances: Arc<dyn InstanceStore>,
    jobs: Arc<dyn ActionJobStore>,
    runner: Arc<dyn ActionRunner>,
}

impl Evaluator {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        workflows: Arc<dyn WorkflowStore>,
        instances: Arc<dyn InstanceStore>,
        jobs: Arc<dyn ActionJobStore>,
        runner: Arc<dyn ActionRunner>,
    ) -> Self {
        Self {
            rules,
            workflows,
            instances,
            jobs,
            runner,
        }
    }

    /// Evaluate one event. Returns the number of actions queued.
    #[instrument(skip(self, event), fields(routing_key = %event.routing_key))]
    pub fn on_event(&self, event: &Event) -> usize {
        let Some(tenant_id) = event.tenant_id else {
            // Rules and workflows are tenant-owned; a tenantless event has
            // nothing to match.
            return 0;
        };

        let mut queued = 0;
        for rule in self
            .rules
            .active_for_trigger(tenant_id, event.routing_key.as_str())
        {
            let fires = rule
                .condition
                .as_ref()
                .map(|c| c.evaluate(&event.body))
                .unwrap_or(true);
            if !fires {
                continue;
            }
            debug!(rule_id = %rule.id, action = %rule.action.name(), "rule fired");
            self.jobs.enqueue(ActionJob::new(
                tenant_id,
                Some(rule.id),
                rule.action.clone(),
                event.body.clone(),
            ));
            self.rules.stamp_fired(tenant_id, rule.id, Utc::now());
            queued += 1;
        }

        for workflow in self
            .workflows
            .active_for_trigger(tenant_id, event.routing_key.as_str())
        {
            let mut instance = WorkflowInstance::start(&workflow, event.body.clone());
            instance.run(&workflow, self.runner.as_ref());
            debug!(
                workflow_id = %workflow.id,
                instance_id = %instance.id,
                state = ?instance.state,
                "workflow instance ran"
            );
            self.instances.save(instance);
        }

        queued
    }

    /// External approval signal for a parked instance.
    pub fn approve_instance(
        &self,
        tenant_id: TenantId,
        instance_id: InstanceId,
    ) -> DomainResult<WorkflowInstance> {
        let mut instance = self
            .instances
            .get(tenant_id, instance_id)
            .ok_or(DomainError::NotFound)?;
        if instance.state != InstanceState::PendingApproval {
            return Err(DomainError::conflict(format!(
                "instance is {:?}, not pending approval",
                instance.state
            )));
        }
        let workflow = self
            .workflows
            .get(tenant_id, instance.workflow_id)
            .ok_or(DomainError::NotFound)?;
        instance.approve(&workflow, self.runner.as_ref());
        self.instances.save(instance.clone());
        Ok(instance)
    }
}

impl EventHandler for Evaluator {
    fn handle(&self, event: &Event) -> HandlerOutcome {
        self.on_event(event);
        HandlerOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionError, ActionKind};
    use crate::condition::{Condition, Operator};
    use crate::jobs::InMemoryActionJobStore;
    use crate::rule::Rule;
    use crate::stores::{InMemoryInstanceStore, InMemoryRuleStore, InMemoryWorkflowStore};
    use crate::workflow::{Edge, EdgeLabel, Node, NodeKind, Workflow};
    use serde_json::{json, Value as JsonValue};

    struct OkRunner;

    impl ActionRunner for OkRunner {
        fn run(
            &self,
            _tenant_id: TenantId,
            _action: &ActionKind,
            _context: &JsonValue,
        ) -> Result<(), ActionError> {
            Ok(())
        }
    }

    fn evaluator() -> (
        Evaluator,
        Arc<InMemoryRuleStore>,
        Arc<InMemoryWorkflowStore>,
        Arc<InMemoryInstanceStore>,
        Arc<InMemoryActionJobStore>,
    ) {
        let rules = Arc::new(InMemoryRuleStore::new());
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        let instances = Arc::new(InMemoryInstanceStore::new());
        let jobs = Arc::new(InMemoryActionJobStore::new());
        let evaluator = Evaluator::new(
            rules.clone(),
            workflows.clone(),
            instances.clone(),
            jobs.clone(),
            Arc::new(OkRunner),
        );
        (evaluator, rules, workflows, instances, jobs)
    }

    fn low_stock_rule(tenant: TenantId) -> Rule {
        Rule::new(
            tenant,
            "stock.update.success",
            Some(Condition::new("quantity_remaining", Operator::Lt, json!(10))),
            ActionKind::RaiseRfq {
                product_field: "product_id".to_string(),
                quantity: 100,
            },
        )
    }

    fn stock_event(tenant: TenantId, remaining: i64) -> Event {
        Event::tenant_scoped(
            "stock.update.success".parse().unwrap(),
            tenant,
            json!({"quantity_remaining": remaining, "product_id": "P"}),
        )
    }

    #[test]
    fn matching_condition_queues_one_action() {
        let (evaluator, rules, _, _, jobs) = evaluator();
        let tenant = TenantId::new();
        let rule = low_stock_rule(tenant);
        let rule_id = rule.id;
        rules.save(rule);

        let queued = evaluator.on_event(&stock_event(tenant, 7));
        assert_eq!(queued, 1);
        assert_eq!(jobs.pending_count(), 1);

        let job = jobs.claim_next(Utc::now()).unwrap();
        assert_eq!(job.rule_id, Some(rule_id));
        assert_eq!(job.context["product_id"], json!("P"));
        match job.action {
            ActionKind::RaiseRfq { quantity, .. } => assert_eq!(quantity, 100),
            other => panic!("unexpected action {other:?}"),
        }
        assert!(rules.get(tenant, rule_id).unwrap().last_fired_at.is_some());
    }

    #[test]
    fn failing_condition_queues_nothing() {
        let (evaluator, rules, _, _, jobs) = evaluator();
        let tenant = TenantId::new();
        rules.save(low_stock_rule(tenant));

        assert_eq!(evaluator.on_event(&stock_event(tenant, 15)), 0);
        assert_eq!(jobs.pending_count(), 0);
    }

    #[test]
    fn evaluation_is_repeatable() {
        let (evaluator, rules, _, _, jobs) = evaluator();
        let tenant = TenantId::new();
        rules.save(low_stock_rule(tenant));

        let event = stock_event(tenant, 7);
        assert_eq!(evaluator.on_event(&event), 1);
        assert_eq!(evaluator.on_event(&event), 1);
        assert_eq!(jobs.pending_count(), 2);
    }

    #[test]
    fn other_tenants_rules_stay_silent() {
        let (evaluator, rules, _, _, jobs) = evaluator();
        rules.save(low_stock_rule(TenantId::new()));

        assert_eq!(evaluator.on_event(&stock_event(TenantId::new(), 7)), 0);
        assert_eq!(jobs.pending_count(), 0);
    }

    #[test]
    fn trigger_spawns_and_runs_workflow_instance() {
        let (evaluator, _, workflows, instances, _) = evaluator();
        let tenant = TenantId::new();
        let workflow = Workflow::new(
            tenant,
            "branch-on-amount",
            vec![
                Node {
                    id: "t".to_string(),
                    kind: NodeKind::Trigger {
                        event: "pos.sale.closed".to_string(),
                    },
                },
                Node {
                    id: "check".to_string(),
                    kind: NodeKind::Condition {
                        condition: Condition::new("amount", Operator::Gt, json!(1000)),
                    },
                },
                Node {
                    id: "yes".to_string(),
                    kind: NodeKind::Action {
                        action: ActionKind::Log {
                            message: "large".to_string(),
                        },
                    },
                },
                Node {
                    id: "no".to_string(),
                    kind: NodeKind::Action {
                        action: ActionKind::Log {
                            message: "small".to_string(),
                        },
                    },
                },
            ],
            vec![
                Edge {
                    source: "t".to_string(),
                    target: "check".to_string(),
                    label: None,
                },
                Edge {
                    source: "check".to_string(),
                    target: "yes".to_string(),
                    label: Some(EdgeLabel::True),
                },
                Edge {
                    source: "check".to_string(),
                    target: "no".to_string(),
                    label: Some(EdgeLabel::False),
                },
            ],
        )
        .unwrap();
        workflows.save(workflow);

        let event = Event::tenant_scoped(
            "pos.sale.closed".parse().unwrap(),
            tenant,
            json!({"amount": 2000}),
        );
        evaluator.on_event(&event);

        let saved = instances.list(tenant);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].state, InstanceState::Completed);
        assert!(saved[0].visited.contains(&"yes".to_string()));
    }

    #[test]
    fn approve_resumes_parked_instance() {
        let (evaluator, _, workflows, instances, _) = evaluator();
        let tenant = TenantId::new();
        let workflow = Workflow::new(
            tenant,
            "gated",
            vec![
                Node {
                    id: "t".to_string(),
                    kind: NodeKind::Trigger {
                        event: "pos.return.created".to_string(),
                    },
                },
                Node {
                    id: "gate".to_string(),
                    kind: NodeKind::Approval {
                        approver_role: None,
                    },
                },
                Node {
                    id: "act".to_string(),
                    kind: NodeKind::Action {
                        action: ActionKind::Log {
                            message: "approved".to_string(),
                        },
                    },
                },
            ],
            vec![
                Edge {
                    source: "t".to_string(),
                    target: "gate".to_string(),
                    label: None,
                },
                Edge {
                    source: "gate".to_string(),
                    target: "act".to_string(),
                    label: None,
                },
            ],
        )
        .unwrap();
        workflows.save(workflow);

        let event = Event::tenant_scoped(
            "pos.return.created".parse().unwrap(),
            tenant,
            json!({"order_number": "O-2"}),
        );
        evaluator.on_event(&event);

        let parked = &instances.list(tenant)[0];
        assert_eq!(parked.state, InstanceState::PendingApproval);

        let resumed = evaluator.approve_instance(tenant, parked.id).unwrap();
        assert_eq!(resumed.state, InstanceState::Completed);

        // A second approval conflicts.
        assert!(evaluator.approve_instance(tenant, parked.id).is_err());
    }
}
