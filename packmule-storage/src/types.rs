//! Core persisted types for the job queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a job.
///
/// `completed`, `expired`, and `canceled` are always terminal; `failed` is
/// terminal unless the job is recurring, in which case the next poll may
/// re-arm it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Error,
    Failed,
    Completed,
    Expired,
    Canceled,
    Ignore,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
            Self::Ignore => "ignore",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "error" => Some(Self::Error),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            "canceled" => Some(Self::Canceled),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }

    /// Returns true if no further transition can occur for a job in this
    /// status. `failed` is only terminal for non-recurring jobs.
    pub const fn is_terminal(self, recurring: bool) -> bool {
        match self {
            Self::Completed | Self::Expired | Self::Canceled => true,
            Self::Failed => !recurring,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durations recorded when a job reaches completion, in milliseconds.
///
/// `waiting` is scheduled→acquired, `running` is acquired→completion,
/// `completed` is scheduled→completion. Each is absent when its inputs are.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stopwatches {
    pub waiting: Option<i64>,
    pub running: Option<i64>,
    pub completed: Option<i64>,
}

/// The persisted job entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque identifier, assigned at creation and stable for life.
    pub id: String,
    /// Routes the job to a registered handler.
    pub job_type: String,
    /// Cross-queue dedup key. At most one non-evicted job per value.
    pub unique_id: Option<String>,
    /// Application payload; the queue never interprets it.
    pub message: Value,
    /// `hostname[pid]` of the producing process.
    pub client: String,
    /// `hostname[pid]` of the current leaseholder, if any.
    pub worker: Option<String>,
    /// Cron expression; when set, the job re-arms after completion/failure.
    pub recurring: Option<String>,
    /// IANA timezone name used for recurrence evaluation.
    pub timezone: String,
    pub status: JobStatus,
    /// Maximum additional attempts after the first.
    pub retries: u32,
    /// Attempts consumed, incremented by each claim.
    pub try_count: u32,
    /// Lower value wins; ties break on earlier `created`.
    pub priority: i32,
    /// Earliest allowed start.
    pub scheduled: DateTime<Utc>,
    /// When the current lease began.
    pub acquired: Option<DateTime<Utc>>,
    /// Lease expiry; past this the job is reclaimable.
    pub timeout: Option<DateTime<Utc>>,
    /// Hard deadline; past this the job is abandoned as `expired`.
    pub expire: Option<DateTime<Utc>>,
    /// When a terminal `completed`/`expired` outcome was recorded.
    pub completed: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub stopwatches: Option<Stopwatches>,
}

impl JobRecord {
    /// A fresh `waiting` record with a new id and audit timestamps of `now`.
    pub fn new(job_type: impl Into<String>, message: Value, client: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            unique_id: None,
            message,
            client: client.into(),
            worker: None,
            recurring: None,
            timezone: "UTC".to_owned(),
            status: JobStatus::Waiting,
            retries: 2,
            try_count: 0,
            priority: 0,
            scheduled: now,
            acquired: None,
            timeout: None,
            expire: None,
            completed: None,
            created: now,
            modified: now,
            stopwatches: None,
        }
    }

    /// The lease currently held on this record, when it is `running`.
    pub fn lease(&self) -> Option<Lease> {
        match (self.status, self.acquired, self.timeout) {
            (JobStatus::Running, Some(acquired), Some(timeout)) => Some(Lease {
                id: self.id.clone(),
                acquired,
                timeout,
            }),
            _ => None,
        }
    }
}

/// A particular claim of a job by a worker.
///
/// The triple is unique across all time: `update_running_job` succeeds only
/// while the persisted row still carries exactly these values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
    pub acquired: DateTime<Utc>,
    pub timeout: DateTime<Utc>,
}

/// Selects a job by its id or by its dedup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSelector {
    Id(String),
    UniqueId(String),
}

/// Severity of a per-job log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only log line scoped to a job.
///
/// Reads project out the store's internal row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_type: String,
    pub job_id: String,
    pub level: LogLevel,
    pub message: Value,
    pub created: DateTime<Utc>,
}

/// The at-most-one result row recorded for a non-recurring completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultRecord {
    pub job_id: String,
    pub job_type: String,
    pub message: Value,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Running,
            JobStatus::Error,
            JobStatus::Failed,
            JobStatus::Completed,
            JobStatus::Expired,
            JobStatus::Canceled,
            JobStatus::Ignore,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal(false));
        assert!(JobStatus::Expired.is_terminal(true));
        assert!(JobStatus::Canceled.is_terminal(true));
        assert!(JobStatus::Failed.is_terminal(false));
        assert!(!JobStatus::Failed.is_terminal(true));
        assert!(!JobStatus::Waiting.is_terminal(false));
        assert!(!JobStatus::Error.is_terminal(false));
    }

    #[test]
    fn new_record_defaults() {
        let record = JobRecord::new("email", json!({"to": "a@b.c"}), "host[1]");
        assert_eq!(record.status, JobStatus::Waiting);
        assert_eq!(record.retries, 2);
        assert_eq!(record.try_count, 0);
        assert_eq!(record.priority, 0);
        assert_eq!(record.timezone, "UTC");
        assert_eq!(record.scheduled, record.created);
        assert!(record.lease().is_none());
    }

    #[test]
    fn lease_requires_running_with_both_instants() {
        let mut record = JobRecord::new("t", Value::Null, "c");
        record.status = JobStatus::Running;
        assert!(record.lease().is_none());

        let now = Utc::now();
        record.acquired = Some(now);
        record.timeout = Some(now + chrono::Duration::seconds(60));
        let lease = record.lease().expect("lease");
        assert_eq!(lease.id, record.id);
        assert_eq!(lease.acquired, now);
    }
}
