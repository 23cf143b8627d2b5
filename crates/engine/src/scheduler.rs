//! Periodic scheduler for time-based rules.
//!
//! Each tick walks every active scheduled rule, asks the rule whether it is
//! due, and fires the same condition-then-action pipeline with a synthetic
//! `{scheduled_at}` event body.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::jobs::{ActionJob, ActionJobStore};
use crate::stores::RuleStore;

/// Default wall-clock interval between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

pub struct Scheduler {
    rules: Arc<dyn RuleStore>,
    jobs: Arc<dyn ActionJobStore>,
    tick_interval: Duration,
}

/// Handle to a running scheduler loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Scheduler {
    pub fn new(rules: Arc<dyn RuleStore>, jobs: Arc<dyn ActionJobStore>) -> Self {
        Self {
            rules,
            jobs,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Run one tick at `now`. Returns the number of rules fired.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        for rule in self.rules.scheduled() {
            if !rule.schedule_due(now) {
                continue;
            }
            let body = json!({
                "tenant_id": rule.tenant_id,
                "scheduled_at": now.to_rfc3339(),
            });
            let fires = rule
                .condition
                .as_ref()
                .map(|c| c.evaluate(&body))
                .unwrap_or(true);
            // Due or not, the schedule advanced; stamping on a false
            // condition keeps last_fired_at non-decreasing and prevents
            // re-evaluating the same instant every tick.
            self.rules.stamp_fired(rule.tenant_id, rule.id, now);
            if !fires {
                continue;
            }
            debug!(rule_id = %rule.id, action = %rule.action.name(), "scheduled rule fired");
            self.jobs.enqueue(ActionJob::new(
                rule.tenant_id,
                Some(rule.id),
                rule.action.clone(),
                body,
            ));
            fired += 1;
        }
        fired
    }

    /// Spawn the tick loop on a worker thread.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("rule-scheduler".to_string())
            .spawn(move || {
                info!(interval_secs = self.tick_interval.as_secs(), "scheduler started");
                loop {
                    match shutdown_rx.recv_timeout(self.tick_interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            self.tick(Utc::now());
                        }
                    }
                }
                info!("scheduler stopped");
            })
            .expect("failed to spawn scheduler thread");

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::cron::CronExpr;
    use crate::jobs::InMemoryActionJobStore;
    use crate::rule::{Rule, Schedule};
    use crate::stores::InMemoryRuleStore;
    use chrono::TimeZone;
    use loomerp_core::TenantId;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn scheduler() -> (Scheduler, Arc<InMemoryRuleStore>, Arc<InMemoryActionJobStore>) {
        let rules = Arc::new(InMemoryRuleStore::new());
        let jobs = Arc::new(InMemoryActionJobStore::new());
        (Scheduler::new(rules.clone(), jobs.clone()), rules, jobs)
    }

    fn cron_rule(tenant: TenantId, expression: &str) -> Rule {
        let mut rule = Rule::new(
            tenant,
            "engine.schedule.tick",
            None,
            ActionKind::Log {
                message: "weekly report".to_string(),
            },
        )
        .with_schedule(Schedule::Cron {
            expression: CronExpr::parse(expression).unwrap(),
        });
        rule.created_at = at(2026, 1, 1, 0, 0, 0);
        rule
    }

    #[test]
    fn cron_rule_fires_once_per_instant() {
        let (scheduler, rules, jobs) = scheduler();
        let tenant = TenantId::new();
        let mut rule = cron_rule(tenant, "0 17 * * 5");
        rule.last_fired_at = Some(at(2026, 8, 6, 18, 0, 0)); // Thursday evening
        let rule_id = rule.id;
        rules.save(rule);

        // Friday 17:00:30: prev_scheduled (17:00) > last_fired → fire.
        assert_eq!(scheduler.tick(at(2026, 8, 7, 17, 0, 30)), 1);
        assert_eq!(jobs.pending_count(), 1);
        assert_eq!(
            rules.get(tenant, rule_id).unwrap().last_fired_at,
            Some(at(2026, 8, 7, 17, 0, 30))
        );

        // Friday 17:01: same instant, no second fire.
        assert_eq!(scheduler.tick(at(2026, 8, 7, 17, 1, 0)), 0);
        assert_eq!(jobs.pending_count(), 1);
    }

    #[test]
    fn interval_rule_honors_elapsed_time() {
        let (scheduler, rules, jobs) = scheduler();
        let tenant = TenantId::new();
        let mut rule = Rule::new(
            tenant,
            "engine.schedule.tick",
            None,
            ActionKind::Log {
                message: "sweep".to_string(),
            },
        )
        .with_schedule(Schedule::Interval { minutes: 30 });
        rule.last_fired_at = Some(at(2026, 8, 7, 11, 45, 0));
        rules.save(rule);

        assert_eq!(scheduler.tick(at(2026, 8, 7, 12, 0, 0)), 0);
        assert_eq!(scheduler.tick(at(2026, 8, 7, 12, 15, 0)), 1);
        assert_eq!(jobs.pending_count(), 1);
    }

    #[test]
    fn never_fired_interval_rule_fires_immediately() {
        let (scheduler, rules, jobs) = scheduler();
        rules.save(
            Rule::new(
                TenantId::new(),
                "engine.schedule.tick",
                None,
                ActionKind::Log {
                    message: "first".to_string(),
                },
            )
            .with_schedule(Schedule::Interval { minutes: 60 }),
        );

        assert_eq!(scheduler.tick(Utc::now()), 1);
        assert_eq!(jobs.pending_count(), 1);
    }

    #[test]
    fn inactive_rules_never_fire() {
        let (scheduler, rules, _jobs) = scheduler();
        let mut rule = cron_rule(TenantId::new(), "* * * * *");
        rule.active = false;
        rules.save(rule);

        assert_eq!(scheduler.tick(Utc::now()), 0);
    }

    #[test]
    fn last_fired_at_is_non_decreasing_across_ticks() {
        let (scheduler, rules, _) = scheduler();
        let tenant = TenantId::new();
        let rule = cron_rule(tenant, "* * * * *");
        let rule_id = rule.id;
        rules.save(rule);

        let mut previous = None;
        for minute in 0..5 {
            scheduler.tick(at(2026, 8, 7, 12, minute, 0));
            let stamped = rules.get(tenant, rule_id).unwrap().last_fired_at;
            assert!(stamped >= previous);
            previous = stamped;
        }
    }
}
