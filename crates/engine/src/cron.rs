//! Five-field cron expressions (minute hour day-of-month month day-of-week).
//!
//! Supports `*`, lists, ranges and steps. Day-of-month and day-of-week
//! combine the Vixie way: when both are restricted, either matching makes
//! the day match. The scheduler needs "most recent scheduled instant at or
//! before now", so the primary operation here is [`CronExpr::prev_occurrence`].

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use loomerp_core::{DomainError, DomainResult};

/// How far back `prev_occurrence` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> DomainResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(DomainError::validation(format!(
                "cron '{expression}' must have 5 fields"
            )));
        };
        Ok(Self {
            source: expression.to_string(),
            minutes: parse_field(minute, 0, 59)?,
            hours: parse_field(hour, 0, 23)? as u32,
            days_of_month: parse_field(dom, 1, 31)? as u32,
            months: parse_field(month, 1, 12)? as u16,
            // 7 is accepted as Sunday and folded onto 0.
            days_of_week: fold_sunday(parse_field(dow, 0, 7)?),
            dom_restricted: *dom != "*",
            dow_restricted: *dow != "*",
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the instant (minute precision) is a scheduled instant.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.time_matches(at) && self.date_matches(at)
    }

    /// Most recent scheduled instant at or before `now`, within the search
    /// horizon.
    pub fn prev_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut at = truncate_to_minute(now);
        let horizon = at - Duration::days(SEARCH_HORIZON_DAYS);

        while at >= horizon {
            if !self.date_matches(at) {
                // Skip straight to the last minute of the previous day.
                let previous_day = at.date_naive().pred_opt()?;
                let end_of_day = previous_day.and_hms_opt(23, 59, 0)?;
                at = Utc.from_utc_datetime(&end_of_day);
                continue;
            }
            if self.time_matches(at) {
                return Some(at);
            }
            at -= Duration::minutes(1);
        }
        None
    }

    fn time_matches(&self, at: DateTime<Utc>) -> bool {
        bit(self.minutes, at.minute()) && bit(self.hours as u64, at.hour())
    }

    fn date_matches(&self, at: DateTime<Utc>) -> bool {
        if !bit(self.months as u64, at.month()) {
            return false;
        }
        let dom_ok = bit(self.days_of_month as u64, at.day());
        let dow_ok = bit(self.days_of_week as u64, at.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }
}

impl TryFrom<String> for CronExpr {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronExpr> for String {
    fn from(value: CronExpr) -> Self {
        value.source
    }
}

impl core::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.source)
    }
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

fn bit(mask: u64, position: u32) -> bool {
    mask & (1 << position) != 0
}

fn fold_sunday(mask: u64) -> u8 {
    let mut mask = mask;
    if bit(mask, 7) {
        mask = (mask & !(1 << 7)) | 1;
    }
    mask as u8
}

/// Parse one field into a bitmask over `[min, max]`.
fn parse_field(field: &str, min: u32, max: u32) -> DomainResult<u64> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| DomainError::validation(format!("bad cron step '{part}'")))?;
                if step == 0 {
                    return Err(DomainError::validation(format!("zero cron step '{part}'")));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u32 = lo
                .parse()
                .map_err(|_| DomainError::validation(format!("bad cron range '{part}'")))?;
            let hi: u32 = hi
                .parse()
                .map_err(|_| DomainError::validation(format!("bad cron range '{part}'")))?;
            (lo, hi)
        } else {
            let value: u32 = range
                .parse()
                .map_err(|_| DomainError::validation(format!("bad cron value '{part}'")))?;
            (value, value)
        };

        if lo < min || hi > max || lo > hi {
            return Err(DomainError::validation(format!(
                "cron value '{part}' outside {min}-{max}"
            )));
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok(mask)
}
