//! Six-field cron expression parser.
//! Layout: "SEC MIN HOUR DOM MON DOW"
//! Fields: *, ?, N, A-B, A,B,C, */N, A/N, A-B/N, JAN..DEC, SUN..SAT
//! Example: "0 30 8 * * 1-5" = weekdays at 08:30:00
//!
//! Matching is done in the local time of the caller's time zone, so the same
//! expression means the same wall-clock time all year round.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use std::fmt;
use std::str::FromStr;

use tempo_core::error::{Result, TempoError};

/// How far ahead `next_after` searches before giving up.
const HORIZON_DAYS: i64 = 366 * 8;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    dom_any: bool,
    dow_any: bool,
}

impl CronExpr {
    /// Parse a six-field expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(TempoError::InvalidSchedule(format!(
                "cron expression '{expression}' needs 6 fields (SEC MIN HOUR DOM MON DOW), got {}",
                parts.len()
            )));
        }

        let seconds = parse_field(parts[0], 0, 59, None)
            .map_err(|e| field_error(expression, "second", e))?;
        let minutes = parse_field(parts[1], 0, 59, None)
            .map_err(|e| field_error(expression, "minute", e))?;
        let hours = parse_field(parts[2], 0, 23, None)
            .map_err(|e| field_error(expression, "hour", e))?;
        let days = parse_field(parts[3], 1, 31, None)
            .map_err(|e| field_error(expression, "day-of-month", e))?;
        let months = parse_field(parts[4], 1, 12, Some((&MONTH_NAMES, 1)))
            .map_err(|e| field_error(expression, "month", e))?;
        let mut weekdays = parse_field(parts[5], 0, 7, Some((&DAY_NAMES, 0)))
            .map_err(|e| field_error(expression, "day-of-week", e))?;
        // 7 is an alias for Sunday
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: parts.join(" "),
            seconds,
            minutes,
            hours,
            days,
            months,
            weekdays,
            dom_any: is_wildcard(parts[3]),
            dow_any: is_wildcard(parts[5]),
        })
    }

    /// Does the given calendar date satisfy the day fields?
    fn matches_date(&self, date: NaiveDate) -> bool {
        if !bit(self.months, date.month()) {
            return false;
        }
        let dom = bit(self.days, date.day());
        let dow = bit(self.weekdays, date.weekday().num_days_from_sunday());
        // Standard cron: when both day fields are restricted either may match.
        if self.dom_any || self.dow_any {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Next instant strictly after `after` that matches, in `after`'s time zone.
    ///
    /// Local times skipped by a DST transition never match; ambiguous local
    /// times resolve to their earliest instant.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let local = after.naive_local();
        let start = local.with_nanosecond(0).unwrap_or(local) + Duration::seconds(1);
        let first_day = start.date();

        let mut date = first_day;
        for _ in 0..HORIZON_DAYS {
            if self.matches_date(date) {
                for hour in bits(self.hours) {
                    for minute in bits(self.minutes) {
                        for second in bits(self.seconds) {
                            let Some(candidate) = date.and_hms_opt(hour, minute, second) else {
                                continue;
                            };
                            if candidate < start {
                                continue;
                            }
                            if let Some(found) = resolve_local(&tz, candidate)
                                && found > *after
                            {
                                return Some(found);
                            }
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = TempoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive).earliest()
}

fn field_error(expression: &str, field: &str, reason: String) -> TempoError {
    TempoError::InvalidSchedule(format!("cron expression '{expression}': {field} {reason}"))
}

fn is_wildcard(field: &str) -> bool {
    field.starts_with('*') || field.starts_with('?')
}

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

/// Iterate the set bits of a field in ascending order.
fn bits(set: u64) -> impl Iterator<Item = u32> {
    (0..64u32).filter(move |v| bit(set, *v))
}

/// Parse one cron field into a bitset of allowed values.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> std::result::Result<u64, String> {
    let mut set = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("has an empty list entry in '{field}'"));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step
                    .parse()
                    .map_err(|_| format!("has an invalid step '{step}'"))?;
                if n == 0 {
                    return Err("has a zero step".into());
                }
                (range, Some(n))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" || range == "?" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, min, max, names)?;
            let hi = parse_value(b, min, max, names)?;
            if lo > hi {
                return Err(format!("has a reversed range '{range}'"));
            }
            (lo, hi)
        } else {
            let v = parse_value(range, min, max, names)?;
            // "5/15" means starting at 5, every 15
            if step.is_some() { (v, max) } else { (v, v) }
        };

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            set |= 1u64 << v;
        }
    }
    Ok(set)
}

fn parse_value(
    token: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> std::result::Result<u32, String> {
    if let Some((names, offset)) = names
        && let Some(idx) = names.iter().position(|n| n.eq_ignore_ascii_case(token))
    {
        return Ok(idx as u32 + offset);
    }
    let v: u32 = token
        .parse()
        .map_err(|_| format!("has an invalid value '{token}'"))?;
    if v < min || v > max {
        return Err(format!("value {v} is outside {min}-{max}"));
    }
    Ok(v)
}
