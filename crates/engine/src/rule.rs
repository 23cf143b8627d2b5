//! Tenant automation rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loomerp_core::{Extensions, RuleId, TenantId};

use crate::action::ActionKind;
use crate::condition::Condition;
use crate::cron::CronExpr;

/// When a scheduled rule fires. Modeled as a sum so a rule can never carry
/// both an interval and a cron expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Interval { minutes: u32 },
    Cron { expression: CronExpr },
}

/// An automation rule: when `trigger_event` arrives (or the schedule is due)
/// and `condition` holds, run `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    /// Routing key this rule listens for (exact match, no wildcards).
    pub trigger_event: String,
    /// Optional guard; a rule without one always fires on its trigger.
    pub condition: Option<Condition>,
    pub action: ActionKind,
    pub schedule: Option<Schedule>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Integrator-defined data; opaque to the engine.
    #[serde(default)]
    pub extensions: Extensions,
    pub active: bool,
}

impl Rule {
    pub fn new(
        tenant_id: TenantId,
        trigger_event: impl Into<String>,
        condition: Option<Condition>,
        action: ActionKind,
    ) -> Self {
        Self {
            id: RuleId::new(),
            tenant_id,
            trigger_event: trigger_event.into(),
            condition,
            action,
            schedule: None,
            last_fired_at: None,
            created_at: Utc::now(),
            extensions: Extensions::new(),
            active: true,
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule.is_some()
    }

    /// Whether the schedule is due at `now`.
    ///
    /// Interval rules that never fired are overdue; cron rules that never
    /// fired wait for their next instant (no retroactive fire), so a fresh
    /// cron rule becomes due the first time an instant passes after creation.
    pub fn schedule_due(&self, now: DateTime<Utc>) -> bool {
        match &self.schedule {
            None => false,
            Some(Schedule::Interval { minutes }) => match self.last_fired_at {
                None => true,
                Some(last) => now - last >= chrono::Duration::minutes(*minutes as i64),
            },
            Some(Schedule::Cron { expression }) => {
                let Some(prev_scheduled) = expression.prev_occurrence(now) else {
                    return false;
                };
                // Strictly greater: firing twice within the same scheduled
                // minute is a double fire. A rule that never fired waits for
                // the first instant after its creation (no retroactive fire).
                prev_scheduled > self.last_fired_at.unwrap_or(self.created_at)
            }
        }
    }
}
