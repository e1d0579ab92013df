//! Client-side job options and record construction.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use packmule_storage::JobRecord;

use crate::error::QueueError;
use crate::recurrence::next_occurrence;

const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_TIMEZONE: &str = "UTC";

/// Options accepted by [`push`](crate::JobQueue::push).
///
/// Every field is optional; unset fields take the queue defaults, and a
/// [`Pusher`](crate::Pusher) overlays per-push options over its defaults
/// field by field.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Cross-queue dedup key; a second push with the same value returns
    /// `false`.
    pub unique_id: Option<String>,
    /// Lower value = more urgent. Default 0.
    pub priority: Option<i32>,
    /// Maximum additional attempts. Default 2.
    pub retries: Option<u32>,
    /// Earliest start pushed this many seconds into the future.
    pub delay_secs: Option<u64>,
    /// Explicit earliest start.
    pub scheduled: Option<DateTime<Utc>>,
    /// Cron expression; the job re-arms after each completion.
    pub recurring: Option<String>,
    /// IANA timezone for recurrence evaluation. Default `UTC`.
    pub timezone: Option<String>,
    /// Hard deadline; a poll past this abandons the job as `expired`.
    pub expire: Option<DateTime<Utc>>,
}

impl JobOptions {
    pub fn unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn delay_secs(mut self, delay_secs: u64) -> Self {
        self.delay_secs = Some(delay_secs);
        self
    }

    pub fn scheduled(mut self, scheduled: DateTime<Utc>) -> Self {
        self.scheduled = Some(scheduled);
        self
    }

    pub fn recurring(mut self, expr: impl Into<String>) -> Self {
        self.recurring = Some(expr.into());
        self
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn expire(mut self, expire: DateTime<Utc>) -> Self {
        self.expire = Some(expire);
        self
    }

    /// Field-wise overlay: values set on `self` win over `base`.
    pub(crate) fn merged_over(&self, base: &JobOptions) -> JobOptions {
        JobOptions {
            unique_id: self.unique_id.clone().or_else(|| base.unique_id.clone()),
            priority: self.priority.or(base.priority),
            retries: self.retries.or(base.retries),
            delay_secs: self.delay_secs.or(base.delay_secs),
            scheduled: self.scheduled.or(base.scheduled),
            recurring: self.recurring.clone().or_else(|| base.recurring.clone()),
            timezone: self.timezone.clone().or_else(|| base.timezone.clone()),
            expire: self.expire.or(base.expire),
        }
    }
}

/// Build the `waiting` record a push persists.
///
/// `scheduled` resolution: an explicit value wins; otherwise a recurrence
/// yields its next occurrence; otherwise now. A positive delay then pushes
/// the result forward via `max(scheduled, now + delay)`.
pub(crate) fn build_record(
    job_type: String,
    message: Value,
    options: &JobOptions,
    client: &str,
) -> Result<JobRecord, QueueError> {
    let now = Utc::now();
    let timezone = options
        .timezone
        .clone()
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_owned());

    let mut scheduled = match options.scheduled {
        Some(scheduled) => scheduled,
        None => match options.recurring.as_deref() {
            Some(expr) => next_occurrence(expr, &timezone, now)?.ok_or_else(|| {
                QueueError::Config(format!("cron expression '{expr}' has no future occurrence"))
            })?,
            None => now,
        },
    };
    if let Some(delay) = options.delay_secs.filter(|&d| d > 0) {
        scheduled = scheduled.max(now + Duration::seconds(delay as i64));
    }

    let mut record = JobRecord::new(job_type, message, client);
    record.unique_id = options.unique_id.clone();
    record.priority = options.priority.unwrap_or(0);
    record.retries = options.retries.unwrap_or(DEFAULT_RETRIES);
    record.recurring = options.recurring.clone();
    record.timezone = timezone;
    record.expire = options.expire;
    record.scheduled = scheduled;
    Ok(record)
}
