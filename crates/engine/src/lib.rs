//! `loomerp-engine` — tenant rules, workflows and the action pipeline.
//!
//! Evaluation is pure: an event (or scheduler tick) against tenant rules and
//! workflow definitions yields a set of actions. Execution is not: actions go
//! through a durable job queue with retry/backoff, and workflow instances
//! advance single-threaded per instance until they complete, fail, or park on
//! an approval.

pub mod action;
pub mod action_log;
pub mod condition;
pub mod cron;
pub mod evaluator;
pub mod executors;
pub mod instance;
pub mod jobs;
pub mod rule;
pub mod scheduler;
pub mod stores;
pub mod workflow;

pub use action::{render_template, ActionError, ActionKind, ActionRunner};
pub use action_log::{ActionLog, ActionLogStore, InMemoryActionLogStore};
pub use condition::{Condition, Operator};
pub use cron::CronExpr;
pub use evaluator::Evaluator;
pub use executors::{
    InMemoryMailTransport, MailMessage, MailSettings, MailTransport, PlatformActionRunner,
};
pub use instance::{InstanceState, WorkflowInstance};
pub use jobs::{
    ActionJob, ActionJobExecutor, ActionJobExecutorHandle, ActionJobStore, InMemoryActionJobStore,
    JobStatus, JobStoreError, RetryPolicy,
};
pub use rule::{Rule, Schedule};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use stores::{
    InMemoryInstanceStore, InMemoryRuleStore, InMemoryWorkflowStore, InstanceStore, RuleStore,
    WorkflowStore,
};
pub use workflow::{Edge, EdgeLabel, Node, NodeKind, Workflow};
