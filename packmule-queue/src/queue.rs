//! The queue engine: polling loop, handler registry, lease supervision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use packmule_sqlite::SqliteDriver;
use packmule_storage::{
    JobLogEntry, JobRecord, JobResultRecord, JobSelector, Storage, StorageRegistry,
};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::handler::{HandlerOpts, JobHandler};
use crate::job::Job;
use crate::options::{build_record, JobOptions};
use crate::worker::worker_id;

const STOP_DRAIN_INTERVAL_MS: u64 = 100;
const LEASE_SUPERVISOR_INTERVAL_SECS: u64 = 1;

/// The registry the engine consults when no explicit one is given: just the
/// bundled SQLite driver.
pub fn default_registry() -> StorageRegistry {
    let mut registry = StorageRegistry::new();
    registry.register(Arc::new(SqliteDriver::new()));
    registry
}

struct HandlerEntry {
    concurrency: usize,
    running: AtomicUsize,
    handler: Arc<dyn JobHandler>,
}

struct RunningEntry {
    job: Job,
    token: CancellationToken,
    /// Set by the lease supervisor once the lease times out; a set flag
    /// means the handler's eventual return value is discarded.
    canceled: bool,
}

struct QueueInner {
    store: Arc<dyn Storage>,
    config: QueueConfig,
    worker: String,
    events: EventBus,
    handlers: RwLock<HashMap<String, Arc<HandlerEntry>>>,
    running_jobs: Mutex<HashMap<String, RunningEntry>>,
    running: AtomicUsize,
    loop_token: Mutex<Option<CancellationToken>>,
    stopped: AtomicBool,
}

/// One worker's view of the shared queue.
///
/// Cheap to clone; clones share the storage connection, handler registry,
/// and run state, so a handler holding a clone can push follow-up jobs or
/// cancel jobs re-entrantly. `stop` must not be called from inside a
/// handler: it waits for the running counter to drain.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Connect through [`default_registry`].
    pub async fn connect(url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        Self::connect_with(&default_registry(), url, config).await
    }

    /// Connect with an explicit driver registry; the url scheme selects the
    /// backend.
    pub async fn connect_with(
        registry: &StorageRegistry,
        url: &str,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let store = registry.open(url, &config.storage).await?;
        let queue = Self {
            inner: Arc::new(QueueInner {
                store,
                config,
                worker: worker_id(),
                events: EventBus::new(),
                handlers: RwLock::new(HashMap::new()),
                running_jobs: Mutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
                loop_token: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        };
        debug!(worker = %queue.inner.worker, "job queue connected");
        queue.inner.events.emit(QueueEvent::Connect);
        Ok(queue)
    }

    /// Listen to the engine's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// This process's `hostname[pid]` identity.
    pub fn worker(&self) -> &str {
        &self.inner.worker
    }

    /// Jobs currently in flight in this process.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register the handler for a job type. At most one handler per type.
    pub fn handle<H>(
        &self,
        job_type: impl Into<String>,
        opts: HandlerOpts,
        handler: H,
    ) -> Result<(), QueueError>
    where
        H: JobHandler + 'static,
    {
        let job_type = job_type.into();
        {
            let mut handlers = write_lock(&self.inner.handlers);
            if handlers.contains_key(&job_type) {
                return Err(QueueError::HandlerExists(job_type));
            }
            handlers.insert(
                job_type.clone(),
                Arc::new(HandlerEntry {
                    concurrency: opts.concurrency.max(1),
                    running: AtomicUsize::new(0),
                    handler: Arc::new(handler),
                }),
            );
        }
        self.inner.events.emit(QueueEvent::Handle { job_type });
        Ok(())
    }

    /// Persist a job as `waiting`.
    ///
    /// Returns `false` when `unique_id` already exists (no event in that
    /// case); any other storage failure propagates.
    pub async fn push(
        &self,
        job_type: impl Into<String>,
        message: Value,
        options: JobOptions,
    ) -> Result<bool, QueueError> {
        let record = build_record(job_type.into(), message, &options, &self.inner.worker)?;
        let saved = self.inner.store.save_job(&record).await?;
        if saved {
            debug!(job_id = %record.id, job_type = %record.job_type, "job pushed");
            self.inner.events.emit(QueueEvent::Push(record));
        }
        Ok(saved)
    }

    /// A push function bound to one job type with default options.
    pub fn pusher(&self, job_type: impl Into<String>, defaults: JobOptions) -> Pusher {
        Pusher {
            queue: self.clone(),
            job_type: job_type.into(),
            defaults,
        }
    }

    /// Cancel a job by id or unique id.
    ///
    /// Returns the post-image, or `None` when no such job exists. If this
    /// process holds a lease on the job, its handler's cancellation token
    /// fires; the dead lease then makes any late completion a no-op.
    pub async fn cancel(&self, selector: JobSelector) -> Result<Option<JobRecord>, QueueError> {
        let post = self.inner.store.cancel_job(&selector).await?;
        if let Some(record) = &post {
            {
                let running = lock(&self.inner.running_jobs);
                if let Some(entry) = running.get(&record.id) {
                    entry.token.cancel();
                }
            }
            debug!(job_id = %record.id, "job canceled");
            self.inner.events.emit(QueueEvent::Cancel(record.clone()));
        }
        Ok(post)
    }

    /// Point lookup of a job's persisted state.
    pub async fn find_job(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.inner.store.find_job_by_id(id).await?)
    }

    /// Read a job's log, ascending by `created`.
    pub async fn read_job_log(
        &self,
        job_id: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<JobLogEntry>, QueueError> {
        Ok(self.inner.store.read_job_log(job_id, skip, limit).await?)
    }

    /// Read a job's recorded result, if any.
    pub async fn read_job_result(
        &self,
        job_id: &str,
    ) -> Result<Option<JobResultRecord>, QueueError> {
        Ok(self.inner.store.read_job_result(job_id).await?)
    }

    /// Begin polling. Idempotent; a second call while running is a no-op.
    pub fn start(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut guard = lock(&self.inner.loop_token);
            if guard.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *guard = Some(token.clone());
            tokio::spawn(run_loop(self.inner.clone(), token.clone()));
            tokio::spawn(lease_supervisor(self.inner.clone(), token));
        }
        self.inner.events.emit(QueueEvent::Start);
    }

    /// Stop polling without disconnecting storage. `start` resumes.
    pub fn pause(&self) {
        if let Some(token) = lock(&self.inner.loop_token).take() {
            token.cancel();
            self.inner.events.emit(QueueEvent::Pause);
        }
    }

    /// Drain and shut down: stop polling, request cooperative cancel of
    /// every running job, wait for the running counter to reach zero, then
    /// disconnect storage.
    pub async fn stop(&self) -> Result<(), QueueError> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(token) = lock(&self.inner.loop_token).take() {
            token.cancel();
        }
        {
            let running = lock(&self.inner.running_jobs);
            for entry in running.values() {
                entry.token.cancel();
            }
        }
        while self.inner.running.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(StdDuration::from_millis(STOP_DRAIN_INTERVAL_MS)).await;
        }
        self.inner.store.disconnect().await?;
        self.inner.events.emit(QueueEvent::Disconnect);
        self.inner.events.emit(QueueEvent::Stop);
        Ok(())
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("worker", &self.inner.worker)
            .field("running", &self.running())
            .finish()
    }
}

/// See [`JobQueue::pusher`].
#[derive(Clone)]
pub struct Pusher {
    queue: JobQueue,
    job_type: String,
    defaults: JobOptions,
}

impl Pusher {
    /// Push with the bound defaults.
    pub async fn push(&self, message: Value) -> Result<bool, QueueError> {
        self.queue
            .push(self.job_type.clone(), message, self.defaults.clone())
            .await
    }

    /// Push with per-call options overlaid over the bound defaults.
    pub async fn push_with(
        &self,
        message: Value,
        options: JobOptions,
    ) -> Result<bool, QueueError> {
        self.queue
            .push(
                self.job_type.clone(),
                message,
                options.merged_over(&self.defaults),
            )
            .await
    }
}

async fn run_loop(inner: Arc<QueueInner>, token: CancellationToken) {
    debug!("polling loop started");
    loop {
        if token.is_cancelled() {
            break;
        }
        let dispatched = match tick(&inner).await {
            Ok(dispatched) => dispatched,
            Err(err) => {
                warn!(error = %err, "poll tick failed");
                inner.events.emit(QueueEvent::Error {
                    message: err.to_string(),
                });
                false
            }
        };
        let sleep_ms = if dispatched {
            inner.config.active_sleep_ms
        } else {
            inner.config.idle_sleep_ms
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(StdDuration::from_millis(sleep_ms)) => {}
        }
    }
    debug!("polling loop exited");
}

/// One pass of the loop: claim at most one runnable job and dispatch it.
/// Returns whether the tick made progress, which selects the following
/// sleep; a dropped duplicate claim counts as an idle tick.
async fn tick(inner: &Arc<QueueInner>) -> Result<bool, QueueError> {
    if inner.running.load(Ordering::SeqCst) >= inner.config.concurrency {
        return Ok(false);
    }
    let types = runnable_types(inner);
    if types.is_empty() {
        return Ok(false);
    }

    let new_timeout = Utc::now() + Duration::seconds(inner.config.timeout_secs as i64);
    let Some(record) = inner
        .store
        .poll_for_runnable_job(&types, new_timeout, &inner.worker)
        .await?
    else {
        return Ok(false);
    };

    let job = Job::new(record, inner.store.clone());
    if lock(&inner.running_jobs).contains_key(&job.id()) {
        // A prior run of this job is still executing here past its lapsed
        // lease; one job never runs concurrently with itself in one engine.
        // The claim just taken lapses with its own timeout.
        debug!(job_id = %job.id(), "claim skipped, job still in flight in this engine");
        return Ok(false);
    }
    if job.has_expired() {
        debug!(job_id = %job.id(), "claimed job passed its hard deadline");
        job.expire().await?;
        return Ok(true);
    }
    if !job.can_retry() {
        job.fail().await?;
        return Ok(true);
    }
    Ok(dispatch(inner.clone(), job))
}

/// Job types whose handler still has concurrency headroom.
fn runnable_types(inner: &QueueInner) -> Vec<String> {
    read_lock(&inner.handlers)
        .iter()
        .filter(|(_, entry)| entry.running.load(Ordering::SeqCst) < entry.concurrency)
        .map(|(job_type, _)| job_type.clone())
        .collect()
}

/// Returns whether the job was actually handed to a handler; a `false`
/// leaves the fresh claim to lapse with its lease.
fn dispatch(inner: Arc<QueueInner>, job: Job) -> bool {
    let record = job.snapshot();
    let entry = read_lock(&inner.handlers).get(&record.job_type).cloned();
    let Some(entry) = entry else {
        // Types are filtered before the poll, so only a handler map change
        // mid-tick can land here; the claim will lapse with its lease.
        inner.events.emit(QueueEvent::Error {
            message: format!("no handler for job type '{}'", record.job_type),
        });
        return false;
    };

    let token = CancellationToken::new();
    {
        // Check-and-insert under one lock: an id already present means a
        // run of this job is still executing, and overwriting its entry
        // would detach that run from the supervisor.
        let mut running = lock(&inner.running_jobs);
        if running.contains_key(&record.id) {
            debug!(job_id = %record.id, "duplicate claim for in-flight job dropped");
            return false;
        }
        running.insert(
            record.id.clone(),
            RunningEntry {
                job: job.clone(),
                token: token.clone(),
                canceled: false,
            },
        );
    }
    inner.running.fetch_add(1, Ordering::SeqCst);
    entry.running.fetch_add(1, Ordering::SeqCst);
    inner.events.emit(QueueEvent::BeforeRun(record.clone()));
    tokio::spawn(run_job(inner, entry, job, token, record.id));
    true
}

async fn run_job(
    inner: Arc<QueueInner>,
    entry: Arc<HandlerEntry>,
    job: Job,
    token: CancellationToken,
    job_id: String,
) {
    match entry.handler.run(job.clone(), token).await {
        Err(err) => {
            let failure = QueueError::Handler(err.to_string());
            warn!(job_id = %job_id, error = %failure, "handler failed");
            inner.events.emit(QueueEvent::HandlerError {
                job: job.snapshot(),
                message: failure.to_string(),
            });
            if let Err(err) = job.record_error(&failure).await {
                inner.events.emit(QueueEvent::Error {
                    message: err.to_string(),
                });
            }
        }
        Ok(result) => {
            let canceled = lock(&inner.running_jobs)
                .get(&job_id)
                .map(|entry| entry.canceled)
                .unwrap_or(false);
            if canceled {
                debug!(job_id = %job_id, "result discarded after cooperative cancel");
            } else if job.has_error() {
                // A failure was already recorded mid-run; the job stays
                // claimable.
            } else {
                match job.complete(result).await {
                    Ok(()) => {}
                    Err(QueueError::LeaseLost) => {
                        debug!(job_id = %job_id, "lease superseded, result discarded");
                    }
                    Err(err) => {
                        inner.events.emit(QueueEvent::Error {
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    lock(&inner.running_jobs).remove(&job_id);
    entry.running.fetch_sub(1, Ordering::SeqCst);
    inner.running.fetch_sub(1, Ordering::SeqCst);
    inner.events.emit(QueueEvent::AfterRun(job.snapshot()));
}

/// Watches running leases at 1 Hz; a lease past its timeout gets its
/// handler's token canceled, once, and a `Timeout` event. Cancellation is
/// cooperative: nothing is forcibly terminated.
async fn lease_supervisor(inner: Arc<QueueInner>, token: CancellationToken) {
    let mut ticks = tokio::time::interval(StdDuration::from_secs(LEASE_SUPERVISOR_INTERVAL_SECS));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticks.tick() => {}
        }
        let mut timed_out = Vec::new();
        {
            let mut running = lock(&inner.running_jobs);
            for entry in running.values_mut() {
                if !entry.canceled && entry.job.has_timed_out() {
                    entry.token.cancel();
                    entry.canceled = true;
                    timed_out.push(entry.job.snapshot());
                }
            }
        }
        for record in timed_out {
            debug!(job_id = %record.id, "lease timed out, cooperative cancel requested");
            inner.events.emit(QueueEvent::Timeout(record));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn read_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(|poison| poison.into_inner())
}

fn write_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(|poison| poison.into_inner())
}
