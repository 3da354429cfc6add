//! Next-fire computation — a pure function over (schedule, last_run, now).
//!
//! No state, no I/O, no clock reads: callers pass `now` in, so the same
//! inputs always produce the same answer. Malformed cron expressions yield
//! `None` here; rejecting them is the scheduler's job at create/update time.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

use crate::tasks::Schedule;

/// Largest interval chrono can represent as a `Duration` (about 292
/// million years). Validation rejects anything bigger; here it maps to
/// `None` so no input can panic the arithmetic.
pub const MAX_INTERVAL_SECS: u64 = (i64::MAX / 1_000) as u64;

/// Compute when a schedule next fires. `None` = never (exhausted one-shot,
/// event-only task, unparseable cron, or an out-of-range interval).
pub fn next_fire(
    schedule: &Schedule,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Interval { every_secs } => match last_run {
            Some(last) => i64::try_from(*every_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|step| last.checked_add_signed(step)),
            None => Some(now),
        },
        Schedule::Cron { expression } => {
            let parsed = parse_cron(expression)?;
            parsed.after(&now).next()
        }
        Schedule::Once { at } => match last_run {
            Some(_) => None,
            None => Some(*at),
        },
        Schedule::EventOnly => None,
    }
}

/// Parse a five- or six-field cron expression. Five-field expressions get a
/// literal seconds field prepended, so "0 8 * * *" means 08:00:00 daily.
pub fn parse_cron(expression: &str) -> Option<CronSchedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expression}"),
        6 => expression.to_string(),
        _ => return None,
    };
    CronSchedule::from_str(&normalized).ok()
}
