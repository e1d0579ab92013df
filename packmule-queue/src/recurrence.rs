//! Recurrence evaluation.
//!
//! Cron parsing is delegated to the `cron` crate (whose expressions carry a
//! leading seconds field); this module only wraps it with timezone-aware
//! evaluation and the engine's error type.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::QueueError;

/// The next instant after `after` matching `expr`, evaluated in `timezone`,
/// or `None` when the schedule has run out.
pub fn next_occurrence(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, QueueError> {
    let schedule = Schedule::from_str(expr)
        .map_err(|e| QueueError::Config(format!("invalid cron expression '{expr}': {e}")))?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| QueueError::Config(format!("unknown timezone '{timezone}'")))?;

    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|occurrence| occurrence.with_timezone(&Utc)))
}
