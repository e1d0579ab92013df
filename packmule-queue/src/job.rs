//! The leased job as the engine and its handler see it.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::debug;

use packmule_storage::{
    JobPatch, JobRecord, JobStatus, LogLevel, Storage, Stopwatches,
};

use crate::error::QueueError;
use crate::recurrence::next_occurrence;

/// A job bound to its storage.
///
/// Clones share one mutable view, so a handler extending its lease via
/// [`extend_timeout`](Job::extend_timeout) changes the lease the engine
/// later completes against. The engine owns the lifecycle transitions;
/// handlers get the read surface plus [`log`](Job::log) and lease renewal.
#[derive(Clone)]
pub struct Job {
    record: Arc<Mutex<JobRecord>>,
    store: Arc<dyn Storage>,
}

impl Job {
    pub(crate) fn new(record: JobRecord, store: Arc<dyn Storage>) -> Self {
        Self {
            record: Arc::new(Mutex::new(record)),
            store,
        }
    }

    fn view(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// A copy of the current in-memory view of the record.
    pub fn snapshot(&self) -> JobRecord {
        self.view().clone()
    }

    pub fn id(&self) -> String {
        self.view().id.clone()
    }

    pub fn job_type(&self) -> String {
        self.view().job_type.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.view().status
    }

    /// A terminal completion has been recorded.
    pub fn is_complete(&self) -> bool {
        let record = self.view();
        record.completed.is_some()
            || matches!(record.status, JobStatus::Completed | JobStatus::Expired)
    }

    /// The current lease has passed its timeout.
    pub fn has_timed_out(&self) -> bool {
        self.view().timeout.is_some_and(|timeout| timeout <= Utc::now())
    }

    /// The hard deadline has passed.
    pub fn has_expired(&self) -> bool {
        self.view().expire.is_some_and(|expire| expire <= Utc::now())
    }

    /// A handler failure has been recorded for the current attempt.
    pub fn has_error(&self) -> bool {
        self.view().status == JobStatus::Error
    }

    /// Attempts consumed have not yet exceeded the retry budget.
    pub fn can_retry(&self) -> bool {
        let record = self.view();
        record.try_count <= record.retries + 1
    }

    /// Append a log entry for this job.
    pub async fn log(&self, level: LogLevel, message: Value) -> Result<(), QueueError> {
        let (job_type, id) = {
            let record = self.view();
            (record.job_type.clone(), record.id.clone())
        };
        self.store.write_job_log(&job_type, &id, level, &message).await?;
        Ok(())
    }

    /// Extend the current lease by `seconds` from now.
    ///
    /// The renewed lease replaces the in-memory view, so a later renewal or
    /// completion is relative to the new timeout. Fails with
    /// [`QueueError::LeaseLost`] when the store no longer carries this
    /// lease.
    pub async fn extend_timeout(&self, seconds: u64) -> Result<(), QueueError> {
        if self.is_complete() {
            return Err(QueueError::State("job is already complete".into()));
        }
        if self.has_timed_out() {
            return Err(QueueError::State("lease has already timed out".into()));
        }
        let lease = self
            .view()
            .lease()
            .ok_or_else(|| QueueError::State("job is not running".into()))?;

        let now = Utc::now();
        let timeout = now + Duration::seconds(seconds as i64);
        let patch = JobPatch::new().timeout(Some(timeout)).modified(now);
        match self.store.update_running_job(&lease, patch).await? {
            None => Err(QueueError::LeaseLost),
            Some(post) => {
                *self.view() = post;
                Ok(())
            }
        }
    }

    /// Record a successful handler return, while the lease still holds.
    ///
    /// A recurring job goes back to `waiting` at its next occurrence with a
    /// fresh try budget; anything else becomes terminal `completed`. The
    /// result row is written only for non-recurring jobs with a non-null
    /// result.
    pub(crate) async fn complete(&self, result: Option<Value>) -> Result<(), QueueError> {
        if self.is_complete() {
            return Err(QueueError::State("job is already complete".into()));
        }
        if self.has_timed_out() {
            return Err(QueueError::State("lease has already timed out".into()));
        }
        let record = self.snapshot();
        let lease = record
            .lease()
            .ok_or_else(|| QueueError::State("job is not running".into()))?;

        let now = Utc::now();
        let stopwatches = Stopwatches {
            waiting: record
                .acquired
                .map(|acquired| (acquired - record.scheduled).num_milliseconds()),
            running: record.acquired.map(|acquired| (now - acquired).num_milliseconds()),
            completed: Some((now - record.scheduled).num_milliseconds()),
        };

        let rearm = match record.recurring.as_deref() {
            Some(expr) => next_occurrence(expr, &record.timezone, now)?,
            None => None,
        };
        let patch = match rearm {
            Some(next) => JobPatch::new()
                .status(JobStatus::Waiting)
                .scheduled(next)
                .acquired(None)
                .try_count(0)
                .timeout(None)
                .modified(now)
                .stopwatches(stopwatches),
            None => JobPatch::new()
                .status(JobStatus::Completed)
                .completed(Some(now))
                .timeout(None)
                .modified(now)
                .stopwatches(stopwatches),
        };

        let Some(post) = self.store.update_running_job(&lease, patch).await? else {
            return Err(QueueError::LeaseLost);
        };
        *self.view() = post;

        if record.recurring.is_none() {
            if let Some(result) = result {
                self.store
                    .write_job_result(&record.job_type, &record.id, &result)
                    .await?;
            }
        }
        Ok(())
    }

    /// Record a handler failure: the job becomes `error` (re-claimable
    /// while retries remain) and the failure is appended to its log.
    pub(crate) async fn record_error(&self, error: &QueueError) -> Result<(), QueueError> {
        let record = self.snapshot();
        let patch = JobPatch::new().status(JobStatus::Error).modified(Utc::now());
        if let Some(post) = self.store.update_job_by_id(&record.id, patch).await? {
            *self.view() = post;
        }
        self.store
            .write_job_log(
                &record.job_type,
                &record.id,
                LogLevel::Error,
                &Value::String(error.to_string()),
            )
            .await?;
        Ok(())
    }

    /// Retries are exhausted. A recurring job re-arms with a fresh budget;
    /// anything else becomes `failed`, with `try_count` stepped back by the
    /// one increment the promoting claim consumed without a run.
    pub(crate) async fn fail(&self) -> Result<(), QueueError> {
        let record = self.snapshot();
        let now = Utc::now();
        let patch = match record.recurring.as_deref() {
            Some(expr) => {
                let mut patch = JobPatch::new()
                    .status(JobStatus::Failed)
                    .acquired(None)
                    .timeout(None)
                    .try_count(0)
                    .modified(now);
                if let Some(next) = next_occurrence(expr, &record.timezone, now)? {
                    patch = patch.scheduled(next);
                }
                patch
            }
            None => JobPatch::new()
                .status(JobStatus::Failed)
                .try_count(record.try_count.saturating_sub(1))
                .modified(now),
        };
        if let Some(post) = self.store.update_job_by_id(&record.id, patch).await? {
            *self.view() = post;
        }
        debug!(job_id = %record.id, "job failed");
        Ok(())
    }

    /// The hard deadline passed before the job could run.
    pub(crate) async fn expire(&self) -> Result<(), QueueError> {
        let id = self.id();
        let now = Utc::now();
        let patch = JobPatch::new()
            .status(JobStatus::Expired)
            .completed(Some(now))
            .modified(now);
        if let Some(post) = self.store.update_job_by_id(&id, patch).await? {
            *self.view() = post;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.snapshot();
        f.debug_struct("Job")
            .field("id", &record.id)
            .field("job_type", &record.job_type)
            .field("status", &record.status)
            .field("try_count", &record.try_count)
            .finish()
    }
}
