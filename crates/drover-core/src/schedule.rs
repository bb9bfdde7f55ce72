//! Firing schedules: fixed intervals (`"15m"`, `"2h30m"`) or cron expressions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AppError;

/// When a registered task fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fire every `Duration`, the first time one interval after the loop starts.
    Every(Duration),
    /// Fire on cron ticks. Holds the expression as written alongside the parsed form.
    Cron {
        expr: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Schedule::Every(interval)
    }

    /// The first firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(interval) => {
                after.checked_add_signed(TimeDelta::from_std(*interval).ok()?)
            }
            Schedule::Cron { schedule, .. } => schedule.after(&after).next(),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(interval) => write!(f, "every {}ms", interval.as_millis()),
            Schedule::Cron { expr, .. } => write!(f, "cron '{expr}'"),
        }
    }
}

impl FromStr for Schedule {
    type Err = AppError;

    /// Anything containing whitespace is read as a cron expression (5 or 6
    /// fields); everything else as an interval.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.split_whitespace().count() > 1 {
            let normalized = normalize_cron(trimmed);
            let schedule =
                cron::Schedule::from_str(&normalized).map_err(|e| AppError::InvalidSchedule {
                    expr: trimmed.to_string(),
                    reason: e.to_string(),
                })?;
            return Ok(Schedule::Cron {
                expr: trimmed.to_string(),
                schedule: Box::new(schedule),
            });
        }

        match parse_interval(trimmed) {
            Some(interval) if !interval.is_zero() => Ok(Schedule::Every(interval)),
            Some(_) => Err(AppError::InvalidSchedule {
                expr: trimmed.to_string(),
                reason: "interval must be greater than zero".into(),
            }),
            None => Err(AppError::InvalidSchedule {
                expr: trimmed.to_string(),
                reason: "expected an interval like '15m' or a cron expression".into(),
            }),
        }
    }
}

/// The `cron` crate wants a leading seconds field; standard 5-field
/// expressions get `0` prepended.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Parse `Xd`, `Xh`, `Xm`, `Xs` components, combinable (`"2h30m"`, `"1d12h"`).
/// A bare number is seconds.
pub fn parse_interval(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }
        let n: u64 = num_buf.parse().ok()?;
        num_buf.clear();
        let unit = match ch {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        total_secs = total_secs.checked_add(n.checked_mul(unit)?)?;
        found_unit = true;
    }

    if !num_buf.is_empty() {
        // "30m15" is ambiguous
        if found_unit {
            return None;
        }
        total_secs = num_buf.parse().ok()?;
    }

    Some(Duration::from_secs(total_secs))
}
