//! Schedule definitions and next-trigger resolution.
//!
//! Every schedule kind compiles to a canonical six-field cron expression and
//! is resolved through [`CronExpr`], so daily/weekly/monthly/custom share one
//! matching engine. Resolution is a pure function of `(schedule, now)`.
//!
//! Monthly schedules on a day a month does not have (e.g. the 31st) skip that
//! month entirely; the date is never clamped to month-end.

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::cron::CronExpr;
use tempo_core::error::{Result, TempoError};

/// When a task fires. Weekdays are 0..=6 with 0 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    Daily { hour: u32, minute: u32 },
    Weekly { hour: u32, minute: u32, weekdays: Vec<u32> },
    Monthly { hour: u32, minute: u32, day: u32 },
    Custom { expression: String },
}

impl Schedule {
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Daily { .. } => "daily",
            Schedule::Weekly { .. } => "weekly",
            Schedule::Monthly { .. } => "monthly",
            Schedule::Custom { .. } => "custom",
        }
    }

    /// Fail fast on out-of-range fields or a malformed custom expression.
    pub fn validate(&self) -> Result<()> {
        self.compile().map(|_| ())
    }

    /// Canonical cron expression for this schedule.
    pub fn to_cron(&self) -> Result<String> {
        self.compile().map(|expr| expr.to_string())
    }

    /// Next trigger strictly after `now`, in `now`'s time zone.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<DateTime<Tz>> {
        let expr = self.compile()?;
        expr.next_after(now).ok_or_else(|| {
            TempoError::InvalidSchedule(format!("schedule '{expr}' never fires"))
        })
    }

    fn compile(&self) -> Result<CronExpr> {
        let text = match self {
            Schedule::Daily { hour, minute } => {
                check_time(*hour, *minute)?;
                format!("0 {minute} {hour} * * *")
            }
            Schedule::Weekly {
                hour,
                minute,
                weekdays,
            } => {
                check_time(*hour, *minute)?;
                if weekdays.is_empty() {
                    return Err(TempoError::InvalidSchedule(
                        "weekly schedule needs at least one weekday".into(),
                    ));
                }
                if let Some(bad) = weekdays.iter().find(|d| **d > 6) {
                    return Err(TempoError::InvalidSchedule(format!(
                        "weekday {bad} is outside 0-6 (0 = Sunday)"
                    )));
                }
                let mut days = weekdays.clone();
                days.sort_unstable();
                days.dedup();
                let days: Vec<String> = days.iter().map(|d| d.to_string()).collect();
                format!("0 {minute} {hour} * * {}", days.join(","))
            }
            Schedule::Monthly { hour, minute, day } => {
                check_time(*hour, *minute)?;
                if !(1..=31).contains(day) {
                    return Err(TempoError::InvalidSchedule(format!(
                        "day-of-month {day} is outside 1-31"
                    )));
                }
                format!("0 {minute} {hour} {day} * *")
            }
            Schedule::Custom { expression } => expression.trim().to_string(),
        };
        CronExpr::parse(&text)
    }
}

fn check_time(hour: u32, minute: u32) -> Result<()> {
    if hour > 23 {
        return Err(TempoError::InvalidSchedule(format!("hour {hour} is outside 0-23")));
    }
    if minute > 59 {
        return Err(TempoError::InvalidSchedule(format!(
            "minute {minute} is outside 0-59"
        )));
    }
    Ok(())
}
