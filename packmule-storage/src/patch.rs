//! Partial updates applied to persisted jobs.

use chrono::{DateTime, Utc};

use crate::types::{JobStatus, Stopwatches};

/// A field-wise patch for a job row.
///
/// Outer `None` leaves the column untouched. For nullable columns the inner
/// `Option` distinguishes setting a value from clearing it, so a lease
/// release can null out `acquired`/`timeout` in the same update that flips
/// the status.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub worker: Option<Option<String>>,
    pub try_count: Option<u32>,
    pub scheduled: Option<DateTime<Utc>>,
    pub acquired: Option<Option<DateTime<Utc>>>,
    pub timeout: Option<Option<DateTime<Utc>>>,
    pub completed: Option<Option<DateTime<Utc>>>,
    pub modified: Option<DateTime<Utc>>,
    pub stopwatches: Option<Stopwatches>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn worker(mut self, worker: Option<String>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn try_count(mut self, try_count: u32) -> Self {
        self.try_count = Some(try_count);
        self
    }

    pub fn scheduled(mut self, scheduled: DateTime<Utc>) -> Self {
        self.scheduled = Some(scheduled);
        self
    }

    pub fn acquired(mut self, acquired: Option<DateTime<Utc>>) -> Self {
        self.acquired = Some(acquired);
        self
    }

    pub fn timeout(mut self, timeout: Option<DateTime<Utc>>) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn completed(mut self, completed: Option<DateTime<Utc>>) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn stopwatches(mut self, stopwatches: Stopwatches) -> Self {
        self.stopwatches = Some(stopwatches);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.worker.is_none()
            && self.try_count.is_none()
            && self.scheduled.is_none()
            && self.acquired.is_none()
            && self.timeout.is_none()
            && self.completed.is_none()
            && self.modified.is_none()
            && self.stopwatches.is_none()
    }
}
