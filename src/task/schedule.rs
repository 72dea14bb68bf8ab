//! Pure schedule arithmetic: given a schedule, an anchor and the last fire
//! time, when is the task next due.

use crate::task::types::Schedule;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

/// Parse a cron expression, accepting the common 5-field form by adding a
/// leading seconds field.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, String> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| format!("invalid cron expression '{}': {}", expression, e))
}

pub fn validate(schedule: &Schedule) -> Result<(), String> {
    match schedule {
        Schedule::Once => Ok(()),
        Schedule::Interval { every_ms: 0 } => Err("interval must be positive".to_string()),
        Schedule::Interval { .. } => Ok(()),
        Schedule::Cron { expression } => {
            let parsed = parse_cron(expression)?;
            if parsed.upcoming(Utc).next().is_none() {
                return Err(format!("cron expression '{}' never fires", expression));
            }
            Ok(())
        }
    }
}

/// Next time the scheduler should fire, measured from `last_fired` or, if
/// the task never fired, from `anchor` (its registration time).
///
/// `Once` is never fired by the scheduler and yields `None`, as does an
/// unparsable cron expression.
pub fn next_fire(
    schedule: &Schedule,
    anchor: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let from = last_fired.unwrap_or(anchor);
    match schedule {
        Schedule::Once => None,
        Schedule::Interval { every_ms } => {
            let every = chrono::Duration::from_std(Duration::from_millis(*every_ms)).ok()?;
            from.checked_add_signed(every)
        }
        Schedule::Cron { expression } => parse_cron(expression).ok()?.after(&from).next(),
    }
}

pub fn is_due(
    schedule: &Schedule,
    anchor: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    next_fire(schedule, anchor, last_fired).is_some_and(|next| next <= now)
}
