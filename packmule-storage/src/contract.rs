//! The behavioral contract every storage backend satisfies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StorageError;
use crate::patch::JobPatch;
use crate::types::{JobLogEntry, JobRecord, JobResultRecord, JobSelector, Lease, LogLevel};

/// Operations the queue engine performs against a backing store.
///
/// Every method is an atomic unit with respect to concurrent callers, in
/// this process or any other sharing the store. Two pollers must never both
/// claim the same job within one lease interval; backends without a native
/// find-and-modify use a guarded update (`WHERE id = ? AND modified = ?`)
/// and retry selection when the guard misses.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert-or-upsert by `id`.
    ///
    /// Returns `Ok(false)` when `unique_id` is set and another non-evicted
    /// job already carries it; any other failure propagates as an error.
    async fn save_job(&self, job: &JobRecord) -> Result<bool, StorageError>;

    /// Point lookup by id.
    async fn find_job_by_id(&self, id: &str) -> Result<Option<JobRecord>, StorageError>;

    /// Unconditional field patch; returns the post-image.
    async fn update_job_by_id(
        &self,
        id: &str,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, StorageError>;

    /// Sets `status = canceled` and bumps `modified` on the selected job,
    /// returning the post-image.
    async fn cancel_job(&self, selector: &JobSelector)
        -> Result<Option<JobRecord>, StorageError>;

    /// The central atomic claim.
    ///
    /// Selects one job with `job_type ∈ types`, `scheduled ≤ now`, and one
    /// of: `waiting`; `running` with an expired lease; `error`; or `failed`
    /// with a recurrence. Ordering is ascending `priority` (lower wins),
    /// then ascending `created`. In the same atomic step the winner becomes
    /// `running` with `acquired = now`, `timeout = new_timeout`,
    /// `worker = worker_id`, `modified = now`, and `try_count + 1`; the
    /// post-image is returned.
    async fn poll_for_runnable_job(
        &self,
        types: &[String],
        new_timeout: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<Option<JobRecord>, StorageError>;

    /// Patch a job only while the given lease is still current.
    ///
    /// The update succeeds only if the persisted row still matches
    /// `status = running ∧ acquired = lease.acquired ∧ timeout =
    /// lease.timeout`; returns `None` when the lease has been superseded.
    async fn update_running_job(
        &self,
        lease: &Lease,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, StorageError>;

    /// Append one log entry for a job.
    async fn write_job_log(
        &self,
        job_type: &str,
        job_id: &str,
        level: LogLevel,
        message: &Value,
    ) -> Result<(), StorageError>;

    /// Read log entries for a job, ascending by `created`.
    async fn read_job_log(
        &self,
        job_id: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<JobLogEntry>, StorageError>;

    /// Record the result for a job, replacing any stale row for the same id.
    async fn write_job_result(
        &self,
        job_type: &str,
        job_id: &str,
        message: &Value,
    ) -> Result<(), StorageError>;

    /// Read the result for a job, if one was recorded.
    async fn read_job_result(&self, job_id: &str)
        -> Result<Option<JobResultRecord>, StorageError>;

    /// Close the backend: stop maintenance tasks and release connections.
    async fn disconnect(&self) -> Result<(), StorageError>;
}
