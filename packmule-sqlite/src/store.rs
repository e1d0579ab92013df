//! The `Storage` implementation over a SQLite pool.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use packmule_storage::{
    JobLogEntry, JobPatch, JobRecord, JobResultRecord, JobSelector, JobStatus, Lease, LogLevel,
    Storage, StorageError, StorageOptions, Stopwatches,
};

use crate::schema;

/// How often a poll reselects after losing the claim guard to a concurrent
/// poller before giving up for this tick.
const CLAIM_ATTEMPTS: usize = 8;

/// Column list shared by selects and `RETURNING` clauses so every post-image
/// decodes through the same row shape.
const JOB_COLUMNS: &str = "id, job_type, unique_id, message, client, worker, recurring, \
                           timezone, status, retries, try_count, priority, scheduled, \
                           acquired, timeout, expire, completed, created, modified, stopwatches";

/// In-memory DSN markers; memory databases must not get file pre-creation
/// and need a pinned single-connection pool to stay alive.
const SQLITE_MEMORY_PATTERNS: &[&[u8]] = &[b":memory:", b"mode=memory"];

/// SQLite-backed job store.
///
/// Owns the connection pool and the TTL sweeper task; `disconnect` stops
/// both.
pub struct SqliteStorage {
    pool: SqlitePool,
    options: StorageOptions,
    sweeper: CancellationToken,
}

impl SqliteStorage {
    /// Open (creating the file and schema if needed) and start the TTL
    /// sweeper.
    pub async fn connect(url: &str, options: &StorageOptions) -> Result<Self, StorageError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StorageError::EmptyUrl);
        }

        ensure_db_file_exists(url)?;

        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(options.connect_timeout_secs));
        pool_options = if is_memory_dsn(url) {
            // A memory database lives and dies with its connection; pin one.
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(options.max_connections)
        };

        let pool = pool_options
            .connect(url)
            .await
            .map_err(|e| StorageError::Connect(e.to_string()))?;

        schema::ensure_schema(&pool, options).await.map_err(db_err)?;

        let storage = Self {
            pool,
            options: options.clone(),
            sweeper: CancellationToken::new(),
        };
        storage.spawn_sweeper();
        Ok(storage)
    }

    /// Evict terminal jobs past their retention and stale log/result rows.
    /// Returns the number of rows removed. The sweeper calls this on a
    /// cadence; it is public so operators and tests can force a sweep.
    pub async fn purge_expired(&self) -> Result<u64, StorageError> {
        purge_expired_inner(&self.pool, &self.options).await
    }

    fn spawn_sweeper(&self) {
        let pool = self.pool.clone();
        let options = self.options.clone();
        let token = self.sweeper.clone();
        tokio::spawn(async move {
            let mut ticks =
                tokio::time::interval(Duration::from_secs(options.sweep_interval_secs.max(1)));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                match purge_expired_inner(&pool, &options).await {
                    Ok(0) => {}
                    Ok(evicted) => debug!(evicted, "evicted expired queue rows"),
                    Err(err) => warn!(error = %err, "eviction sweep failed"),
                }
            }
        });
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_job(&self, job: &JobRecord) -> Result<bool, StorageError> {
        let sql = format!(
            "INSERT INTO {jobs} ({JOB_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                job_type = excluded.job_type, unique_id = excluded.unique_id,
                message = excluded.message, client = excluded.client,
                worker = excluded.worker, recurring = excluded.recurring,
                timezone = excluded.timezone, status = excluded.status,
                retries = excluded.retries, try_count = excluded.try_count,
                priority = excluded.priority, scheduled = excluded.scheduled,
                acquired = excluded.acquired, timeout = excluded.timeout,
                expire = excluded.expire, completed = excluded.completed,
                created = excluded.created, modified = excluded.modified,
                stopwatches = excluded.stopwatches",
            jobs = self.options.jobs_table,
        );

        let result = sqlx::query(&sql)
            .bind(&job.id)
            .bind(&job.job_type)
            .bind(&job.unique_id)
            .bind(encode_json(&job.message)?)
            .bind(&job.client)
            .bind(&job.worker)
            .bind(&job.recurring)
            .bind(&job.timezone)
            .bind(job.status.as_str())
            .bind(job.retries as i64)
            .bind(job.try_count as i64)
            .bind(job.priority as i64)
            .bind(job.scheduled)
            .bind(job.acquired)
            .bind(job.timeout)
            .bind(job.expire)
            .bind(job.completed)
            .bind(job.created)
            .bind(job.modified)
            .bind(encode_stopwatches(job.stopwatches.as_ref())?)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => {
                debug!(job_id = %job.id, unique_id = ?job.unique_id, "duplicate unique_id, save rejected");
                Ok(false)
            }
            Err(err) => Err(db_err(err)),
        }
    }

    async fn find_job_by_id(&self, id: &str) -> Result<Option<JobRecord>, StorageError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {jobs} WHERE id = ?",
            jobs = self.options.jobs_table,
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(JobRow::into_record)
            .transpose()
    }

    async fn update_job_by_id(
        &self,
        id: &str,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, StorageError> {
        if patch.is_empty() {
            return self.find_job_by_id(id).await;
        }
        let sql = format!(
            "UPDATE {jobs} SET {sets} WHERE id = ? RETURNING {JOB_COLUMNS}",
            jobs = self.options.jobs_table,
            sets = patch_clauses(&patch).join(", "),
        );
        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        for bind in patch_binds(&patch)? {
            query = match bind {
                PatchBind::Text(v) => query.bind(v),
                PatchBind::OptText(v) => query.bind(v),
                PatchBind::Int(v) => query.bind(v),
                PatchBind::Instant(v) => query.bind(v),
                PatchBind::OptInstant(v) => query.bind(v),
            };
        }
        query
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(JobRow::into_record)
            .transpose()
    }

    async fn cancel_job(
        &self,
        selector: &JobSelector,
    ) -> Result<Option<JobRecord>, StorageError> {
        let (column, value) = match selector {
            JobSelector::Id(id) => ("id", id),
            JobSelector::UniqueId(unique_id) => ("unique_id", unique_id),
        };
        let sql = format!(
            "UPDATE {jobs} SET status = 'canceled', modified = ?
             WHERE {column} = ? RETURNING {JOB_COLUMNS}",
            jobs = self.options.jobs_table,
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(Utc::now())
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(JobRow::into_record)
            .transpose()
    }

    async fn poll_for_runnable_job(
        &self,
        types: &[String],
        new_timeout: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<Option<JobRecord>, StorageError> {
        if types.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; types.len()].join(", ");
        let select = format!(
            "SELECT id, modified FROM {jobs}
             WHERE job_type IN ({placeholders})
               AND scheduled <= ?
               AND (status = 'waiting'
                 OR (status = 'running' AND timeout <= ?)
                 OR status = 'error'
                 OR (status = 'failed' AND recurring IS NOT NULL))
             ORDER BY priority ASC, created ASC
             LIMIT 1",
            jobs = self.options.jobs_table,
        );
        let claim = format!(
            "UPDATE {jobs}
             SET status = 'running', acquired = ?, timeout = ?, worker = ?,
                 modified = ?, try_count = try_count + 1
             WHERE id = ? AND modified = ?
             RETURNING {JOB_COLUMNS}",
            jobs = self.options.jobs_table,
        );

        for _ in 0..CLAIM_ATTEMPTS {
            let now = Utc::now();
            let mut candidates = sqlx::query_as::<_, CandidateRow>(&select);
            for job_type in types {
                candidates = candidates.bind(job_type);
            }
            let Some(candidate) = candidates
                .bind(now)
                .bind(now)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
            else {
                return Ok(None);
            };

            // The `modified` guard loses when a concurrent poller claimed
            // the same row between our select and this update.
            let claimed = sqlx::query_as::<_, JobRow>(&claim)
                .bind(now)
                .bind(new_timeout)
                .bind(worker_id)
                .bind(now)
                .bind(&candidate.id)
                .bind(candidate.modified)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

            if let Some(row) = claimed {
                return row.into_record().map(Some);
            }
            debug!(job_id = %candidate.id, "claim guard missed, reselecting");
        }

        Ok(None)
    }

    async fn update_running_job(
        &self,
        lease: &Lease,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, StorageError> {
        if patch.is_empty() {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM {jobs}
                 WHERE id = ? AND status = 'running' AND acquired = ? AND timeout = ?",
                jobs = self.options.jobs_table,
            );
            return sqlx::query_as::<_, JobRow>(&sql)
                .bind(&lease.id)
                .bind(lease.acquired)
                .bind(lease.timeout)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .map(JobRow::into_record)
                .transpose();
        }

        let sql = format!(
            "UPDATE {jobs} SET {sets}
             WHERE id = ? AND status = 'running' AND acquired = ? AND timeout = ?
             RETURNING {JOB_COLUMNS}",
            jobs = self.options.jobs_table,
            sets = patch_clauses(&patch).join(", "),
        );
        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        for bind in patch_binds(&patch)? {
            query = match bind {
                PatchBind::Text(v) => query.bind(v),
                PatchBind::OptText(v) => query.bind(v),
                PatchBind::Int(v) => query.bind(v),
                PatchBind::Instant(v) => query.bind(v),
                PatchBind::OptInstant(v) => query.bind(v),
            };
        }
        query
            .bind(&lease.id)
            .bind(lease.acquired)
            .bind(lease.timeout)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(JobRow::into_record)
            .transpose()
    }

    async fn write_job_log(
        &self,
        job_type: &str,
        job_id: &str,
        level: LogLevel,
        message: &Value,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {logs} (id, job_type, job_id, level, message, created)
             VALUES (?, ?, ?, ?, ?, ?)",
            logs = self.options.job_logs_table,
        );
        sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(job_type)
            .bind(job_id)
            .bind(level.as_str())
            .bind(encode_json(message)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn read_job_log(
        &self,
        job_id: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<JobLogEntry>, StorageError> {
        // rowid breaks ties between entries written in the same instant.
        let sql = format!(
            "SELECT job_type, job_id, level, message, created FROM {logs}
             WHERE job_id = ?
             ORDER BY created ASC, rowid ASC
             LIMIT ? OFFSET ?",
            logs = self.options.job_logs_table,
        );
        let rows = sqlx::query_as::<_, LogRow>(&sql)
            .bind(job_id)
            .bind(limit as i64)
            .bind(skip as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(LogRow::into_entry).collect()
    }

    async fn write_job_result(
        &self,
        job_type: &str,
        job_id: &str,
        message: &Value,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {results} (job_id, job_type, message, created)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(job_id) DO UPDATE SET
                job_type = excluded.job_type,
                message = excluded.message,
                created = excluded.created",
            results = self.options.job_results_table,
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(job_type)
            .bind(encode_json(message)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn read_job_result(
        &self,
        job_id: &str,
    ) -> Result<Option<JobResultRecord>, StorageError> {
        let sql = format!(
            "SELECT job_id, job_type, message, created FROM {results} WHERE job_id = ?",
            results = self.options.job_results_table,
        );
        sqlx::query_as::<_, ResultRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(ResultRow::into_record)
            .transpose()
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.sweeper.cancel();
        self.pool.close().await;
        Ok(())
    }
}

async fn purge_expired_inner(
    pool: &SqlitePool,
    options: &StorageOptions,
) -> Result<u64, StorageError> {
    let cutoff = Utc::now() - chrono::Duration::seconds(options.ttl_secs as i64);
    let mut evicted = 0u64;

    let sql = format!(
        "DELETE FROM {jobs} WHERE completed IS NOT NULL AND completed <= ?",
        jobs = options.jobs_table,
    );
    evicted += sqlx::query(&sql)
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(db_err)?
        .rows_affected();

    for table in [&options.job_logs_table, &options.job_results_table] {
        let sql = format!("DELETE FROM {table} WHERE created <= ?");
        evicted += sqlx::query(&sql)
            .bind(cutoff)
            .execute(pool)
            .await
            .map_err(db_err)?
            .rows_affected();
    }

    Ok(evicted)
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: String,
    modified: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    unique_id: Option<String>,
    message: String,
    client: String,
    worker: Option<String>,
    recurring: Option<String>,
    timezone: String,
    status: String,
    retries: i64,
    try_count: i64,
    priority: i64,
    scheduled: DateTime<Utc>,
    acquired: Option<DateTime<Utc>>,
    timeout: Option<DateTime<Utc>>,
    expire: Option<DateTime<Utc>>,
    completed: Option<DateTime<Utc>>,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    stopwatches: Option<String>,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord, StorageError> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            StorageError::CorruptRow(format!("unknown status '{}' on job {}", self.status, self.id))
        })?;
        let message = decode_json(&self.message, &self.id)?;
        let stopwatches = self
            .stopwatches
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<Stopwatches>(raw).map_err(|e| {
                    StorageError::CorruptRow(format!("stopwatches on job {}: {e}", self.id))
                })
            })
            .transpose()?;

        Ok(JobRecord {
            id: self.id,
            job_type: self.job_type,
            unique_id: self.unique_id,
            message,
            client: self.client,
            worker: self.worker,
            recurring: self.recurring,
            timezone: self.timezone,
            status,
            retries: self.retries as u32,
            try_count: self.try_count as u32,
            priority: self.priority as i32,
            scheduled: self.scheduled,
            acquired: self.acquired,
            timeout: self.timeout,
            expire: self.expire,
            completed: self.completed,
            created: self.created,
            modified: self.modified,
            stopwatches,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    job_type: String,
    job_id: String,
    level: String,
    message: String,
    created: DateTime<Utc>,
}

impl LogRow {
    fn into_entry(self) -> Result<JobLogEntry, StorageError> {
        let level = LogLevel::parse(&self.level).ok_or_else(|| {
            StorageError::CorruptRow(format!(
                "unknown log level '{}' for job {}",
                self.level, self.job_id
            ))
        })?;
        let message = decode_json(&self.message, &self.job_id)?;
        Ok(JobLogEntry {
            job_type: self.job_type,
            job_id: self.job_id,
            level,
            message,
            created: self.created,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    job_id: String,
    job_type: String,
    message: String,
    created: DateTime<Utc>,
}

impl ResultRow {
    fn into_record(self) -> Result<JobResultRecord, StorageError> {
        let message = decode_json(&self.message, &self.job_id)?;
        Ok(JobResultRecord {
            job_id: self.job_id,
            job_type: self.job_type,
            message,
            created: self.created,
        })
    }
}

/// SET clauses for the present patch fields, in the order `bind_patch`
/// binds them.
fn patch_clauses(patch: &JobPatch) -> Vec<&'static str> {
    let mut sets = Vec::new();
    if patch.status.is_some() {
        sets.push("status = ?");
    }
    if patch.worker.is_some() {
        sets.push("worker = ?");
    }
    if patch.try_count.is_some() {
        sets.push("try_count = ?");
    }
    if patch.scheduled.is_some() {
        sets.push("scheduled = ?");
    }
    if patch.acquired.is_some() {
        sets.push("acquired = ?");
    }
    if patch.timeout.is_some() {
        sets.push("timeout = ?");
    }
    if patch.completed.is_some() {
        sets.push("completed = ?");
    }
    if patch.modified.is_some() {
        sets.push("modified = ?");
    }
    if patch.stopwatches.is_some() {
        sets.push("stopwatches = ?");
    }
    sets
}

/// Owned bind values for a patch, in `patch_clauses` order.
enum PatchBind {
    Text(&'static str),
    OptText(Option<String>),
    Int(i64),
    Instant(DateTime<Utc>),
    OptInstant(Option<DateTime<Utc>>),
}

fn patch_binds(patch: &JobPatch) -> Result<Vec<PatchBind>, StorageError> {
    let mut binds = Vec::new();
    if let Some(status) = patch.status {
        binds.push(PatchBind::Text(status.as_str()));
    }
    if let Some(worker) = &patch.worker {
        binds.push(PatchBind::OptText(worker.clone()));
    }
    if let Some(try_count) = patch.try_count {
        binds.push(PatchBind::Int(try_count as i64));
    }
    if let Some(scheduled) = patch.scheduled {
        binds.push(PatchBind::Instant(scheduled));
    }
    if let Some(acquired) = patch.acquired {
        binds.push(PatchBind::OptInstant(acquired));
    }
    if let Some(timeout) = patch.timeout {
        binds.push(PatchBind::OptInstant(timeout));
    }
    if let Some(completed) = patch.completed {
        binds.push(PatchBind::OptInstant(completed));
    }
    if let Some(modified) = patch.modified {
        binds.push(PatchBind::Instant(modified));
    }
    if let Some(stopwatches) = &patch.stopwatches {
        binds.push(PatchBind::OptText(Some(
            serde_json::to_string(stopwatches)
                .map_err(|e| StorageError::Backend(format!("encoding stopwatches: {e}")))?,
        )));
    }
    Ok(binds)
}

fn encode_json(value: &Value) -> Result<String, StorageError> {
    serde_json::to_string(value)
        .map_err(|e| StorageError::Backend(format!("encoding json payload: {e}")))
}

fn encode_stopwatches(stopwatches: Option<&Stopwatches>) -> Result<Option<String>, StorageError> {
    stopwatches
        .map(|s| {
            serde_json::to_string(s)
                .map_err(|e| StorageError::Backend(format!("encoding stopwatches: {e}")))
        })
        .transpose()
}

fn decode_json(raw: &str, job_id: &str) -> Result<Value, StorageError> {
    serde_json::from_str(raw)
        .map_err(|e| StorageError::CorruptRow(format!("payload on job {job_id}: {e}")))
}

fn db_err(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

fn is_memory_dsn(url: &str) -> bool {
    let bytes = url.as_bytes();
    SQLITE_MEMORY_PATTERNS.iter().any(|&pattern| {
        bytes
            .windows(pattern.len())
            .any(|window| window.eq_ignore_ascii_case(pattern))
    })
}

/// For file-backed DSNs, create the parent directory and the database file
/// up front. This avoids sqlx returning "unable to open database file" when
/// either is missing.
fn ensure_db_file_exists(database_url: &str) -> Result<(), StorageError> {
    use std::fs::{create_dir_all, File};
    use std::path::Path;

    if is_memory_dsn(database_url) {
        return Ok(());
    }

    let Some(clean_path) = extract_path(database_url) else {
        return Ok(());
    };

    let db_path = Path::new(clean_path);
    if let Some(parent) = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && !p.exists())
    {
        create_dir_all(parent).map_err(|e| {
            StorageError::FileCreation(format!(
                "failed to create parent directory '{}': {e}",
                parent.display()
            ))
        })?;
    }

    if !db_path.exists() {
        File::create(db_path).map_err(|e| {
            StorageError::FileCreation(format!(
                "failed to create DB file '{}': {e}",
                db_path.display()
            ))
        })?;
    }

    Ok(())
}

/// Extract the file path from a SQLite connection URL. Returns None for
/// empty paths.
fn extract_path(url: &str) -> Option<&str> {
    let mut path = url;
    path = path
        .strip_prefix("sqlite://")
        .or_else(|| path.strip_prefix("sqlite:"))
        .unwrap_or(path);
    path = path.strip_prefix("//").unwrap_or(path);
    path = path.strip_prefix("file:").unwrap_or(path);

    if let Some(idx) = path.find('?') {
        path = &path[..idx];
    }

    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    // On Windows: strip leading slash before a drive letter ("/C:/...").
    if path.len() > 2 && path.starts_with('/') && path.as_bytes().get(2) == Some(&b':') {
        Some(&path[1..])
    } else {
        Some(path)
    }
}
