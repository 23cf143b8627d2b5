//! Durable action job queue.
//!
//! Rule firings never execute actions inline: they enqueue an [`ActionJob`]
//! here and a worker drains the queue, retrying with exponential backoff up
//! to a per-action cap. Exhausted jobs land in the action log and stay
//! queryable for re-queue.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use loomerp_core::{RuleId, TenantId};

use crate::action::{ActionError, ActionKind, ActionRunner};
use crate::action_log::{ActionLog, ActionLogStore};

/// Retry policy: exponential backoff from `base_delay`, capped at
/// `max_delay`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        let factor = 1u64 << (attempt - 1).min(20);
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    /// Failed with budget remaining; `scheduled_at` holds the retry time.
    Failed { error: String, attempt: u32 },
    /// Budget spent; recorded to the action log.
    Exhausted { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Exhausted { .. })
    }
}

/// One queued action execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionJob {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub rule_id: Option<RuleId>,
    pub action: ActionKind,
    /// Event body (or synthetic schedule payload) the action runs against.
    pub context: JsonValue,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest execution time; `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl ActionJob {
    pub fn new(
        tenant_id: TenantId,
        rule_id: Option<RuleId>,
        action: ActionKind,
        context: JsonValue,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            rule_id,
            action,
            context,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Failed { .. })
            && self.scheduled_at.map(|at| now >= at).unwrap_or(true)
    }

    fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    fn mark_succeeded(&mut self) {
        self.status = JobStatus::Succeeded;
        self.updated_at = Utc::now();
    }

    /// Schedule a retry, or exhaust if the budget is spent.
    fn mark_failed(&mut self, error: String) {
        let now = Utc::now();
        self.updated_at = now;
        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::Exhausted {
                error,
                attempts: self.attempt,
            };
        }
    }

    fn mark_exhausted(&mut self, error: String) {
        self.updated_at = Utc::now();
        self.status = JobStatus::Exhausted {
            error,
            attempts: self.attempt,
        };
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobStoreError {
    #[error("job not found")]
    NotFound,
}

/// Job storage.
pub trait ActionJobStore: Send + Sync {
    fn enqueue(&self, job: ActionJob) -> Uuid;

    fn get(&self, id: Uuid) -> Option<ActionJob>;

    fn update(&self, job: &ActionJob) -> Result<(), JobStoreError>;

    /// Claim the next ready job (marks it running).
    fn claim_next(&self, now: DateTime<Utc>) -> Option<ActionJob>;

    /// Jobs whose retries ran out.
    fn list_exhausted(&self, tenant_id: TenantId, limit: usize) -> Vec<ActionJob>;

    /// Put an exhausted job back on the queue with a fresh budget.
    fn requeue_exhausted(&self, id: Uuid) -> Result<ActionJob, JobStoreError>;

    fn pending_count(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemoryActionJobStore {
    jobs: Mutex<HashMap<Uuid, ActionJob>>,
}

impl InMemoryActionJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActionJobStore for InMemoryActionJobStore {
    fn enqueue(&self, job: ActionJob) -> Uuid {
        let id = job.id;
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, job);
        id
    }

    fn get(&self, id: Uuid) -> Option<ActionJob> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    fn update(&self, job: &ActionJob) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound),
        }
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Option<ActionJob> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        // Oldest ready job first (UUIDv7 ids are time-ordered).
        let id = jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| j.id)
            .map(|j| j.id)?;
        let job = jobs.get_mut(&id)?;
        job.mark_running();
        Some(job.clone())
    }

    fn list_exhausted(&self, tenant_id: TenantId, limit: usize) -> Vec<ActionJob> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|j| j.tenant_id == tenant_id && matches!(j.status, JobStatus::Exhausted { .. }))
            .take(limit)
            .cloned()
            .collect()
    }

    fn requeue_exhausted(&self, id: Uuid) -> Result<ActionJob, JobStoreError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound)?;
        if !matches!(job.status, JobStatus::Exhausted { .. }) {
            return Err(JobStoreError::NotFound);
        }
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn pending_count(&self) -> usize {
        let now = Utc::now();
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|j| j.is_ready(now))
            .count()
    }
}

/// Handle to a running job executor.
#[derive(Debug)]
pub struct ActionJobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ActionJobExecutorHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Drains the job queue on a worker thread.
pub struct ActionJobExecutor {
    store: Arc<dyn ActionJobStore>,
    runner: Arc<dyn ActionRunner>,
    action_log: Arc<dyn ActionLogStore>,
    poll_interval: Duration,
}

impl ActionJobExecutor {
    pub fn new(
        store: Arc<dyn ActionJobStore>,
        runner: Arc<dyn ActionRunner>,
        action_log: Arc<dyn ActionLogStore>,
    ) -> Self {
        Self {
            store,
            runner,
            action_log,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Execute one claimed job; used by the loop and directly by tests.
    pub fn execute(&self, job: &mut ActionJob) {
        match self.runner.run(job.tenant_id, &job.action, &job.context) {
            Ok(()) => {
                debug!(job_id = %job.id, kind = %job.action.name(), "action succeeded");
                job.mark_succeeded();
            }
            Err(ActionError::Transient(e)) => {
                warn!(job_id = %job.id, kind = %job.action.name(), error = %e, "action failed");
                job.mark_failed(e);
            }
            Err(ActionError::Permanent(e)) => {
                warn!(job_id = %job.id, kind = %job.action.name(), error = %e, "action permanently failed");
                job.mark_exhausted(e);
            }
        }

        if let JobStatus::Exhausted { ref error, .. } = job.status {
            self.action_log.record(ActionLog::failed(
                job.tenant_id,
                job.action.name(),
                job.rule_id,
                error.clone(),
            ));
        }
        if let Err(e) = self.store.update(job) {
            warn!(job_id = %job.id, error = %e, "failed to persist job state");
        }
    }

    /// Spawn the polling loop on a worker thread.
    pub fn spawn(self) -> ActionJobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("action-jobs".to_string())
            .spawn(move || {
                info!("action job executor started");
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                    match self.store.claim_next(Utc::now()) {
                        Some(mut job) => self.execute(&mut job),
                        None => thread::sleep(self.poll_interval),
                    }
                }
                info!("action job executor stopped");
            })
            .expect("failed to spawn action job executor");

        ActionJobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::InMemoryActionLogStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedRunner {
        calls: AtomicU32,
        result: fn(u32) -> Result<(), ActionError>,
    }

    impl ActionRunner for ScriptedRunner {
        fn run(
            &self,
            _tenant_id: TenantId,
            _action: &ActionKind,
            _context: &JsonValue,
        ) -> Result<(), ActionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)(call)
        }
    }

    fn job(tenant: TenantId) -> ActionJob {
        ActionJob::new(
            tenant,
            None,
            ActionKind::Log {
                message: "hi".to_string(),
            },
            json!({}),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        })
    }

    fn executor(result: fn(u32) -> Result<(), ActionError>) -> (ActionJobExecutor, Arc<InMemoryActionJobStore>, Arc<InMemoryActionLogStore>) {
        let store = Arc::new(InMemoryActionJobStore::new());
        let log = Arc::new(InMemoryActionLogStore::new());
        let runner = Arc::new(ScriptedRunner {
            calls: AtomicU32::new(0),
            result,
        });
        (
            ActionJobExecutor::new(store.clone(), runner, log.clone()),
            store,
            log,
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn successful_job_terminates() {
        let tenant = TenantId::new();
        let (executor, store, log) = executor(|_| Ok(()));
        store.enqueue(job(tenant));

        let mut claimed = store.claim_next(Utc::now()).unwrap();
        executor.execute(&mut claimed);

        assert_eq!(store.get(claimed.id).unwrap().status, JobStatus::Succeeded);
        assert!(log.list(tenant, 10).is_empty());
    }

    #[test]
    fn transient_failure_retries_then_logs() {
        let tenant = TenantId::new();
        let (executor, store, log) =
            executor(|_| Err(ActionError::Transient("503 from downstream".to_string())));
        store.enqueue(job(tenant));

        // Attempt 1: scheduled for retry.
        let mut claimed = store.claim_next(Utc::now()).unwrap();
        executor.execute(&mut claimed);
        assert!(matches!(
            store.get(claimed.id).unwrap().status,
            JobStatus::Failed { attempt: 1, .. }
        ));

        // Attempt 2 (after backoff): budget spent.
        let later = Utc::now() + chrono::Duration::seconds(1);
        let mut claimed = store.claim_next(later).unwrap();
        executor.execute(&mut claimed);
        assert!(matches!(
            store.get(claimed.id).unwrap().status,
            JobStatus::Exhausted { attempts: 2, .. }
        ));

        let entries = log.list(tenant, 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "log");
    }

    #[test]
    fn permanent_failure_skips_retries() {
        let tenant = TenantId::new();
        let (executor, store, log) =
            executor(|_| Err(ActionError::Permanent("bad config".to_string())));
        store.enqueue(job(tenant));

        let mut claimed = store.claim_next(Utc::now()).unwrap();
        executor.execute(&mut claimed);

        assert!(matches!(
            store.get(claimed.id).unwrap().status,
            JobStatus::Exhausted { attempts: 1, .. }
        ));
        assert_eq!(log.list(tenant, 10).len(), 1);
    }

    #[test]
    fn exhausted_job_can_be_requeued() {
        let tenant = TenantId::new();
        let (executor, store, _log) =
            executor(|_| Err(ActionError::Permanent("bad config".to_string())));
        let id = store.enqueue(job(tenant));

        let mut claimed = store.claim_next(Utc::now()).unwrap();
        executor.execute(&mut claimed);
        assert_eq!(store.list_exhausted(tenant, 10).len(), 1);

        let requeued = store.requeue_exhausted(id).unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempt, 0);
        assert!(store.claim_next(Utc::now()).is_some());
    }

    #[test]
    fn claim_respects_backoff_schedule() {
        let tenant = TenantId::new();
        let store = InMemoryActionJobStore::new();
        let mut delayed = job(tenant);
        delayed.scheduled_at = Some(Utc::now() + chrono::Duration::minutes(5));
        store.enqueue(delayed);

        assert!(store.claim_next(Utc::now()).is_none());
        assert!(store
            .claim_next(Utc::now() + chrono::Duration::minutes(6))
            .is_some());
    }
}
