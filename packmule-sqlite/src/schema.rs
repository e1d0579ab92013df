//! Table and index creation.
//!
//! Table names are configurable, so DDL is rendered per connection rather
//! than shipped as fixed migration files. All statements are idempotent.

use packmule_storage::StorageOptions;
use sqlx::sqlite::SqlitePool;

pub(crate) async fn ensure_schema(
    pool: &SqlitePool,
    options: &StorageOptions,
) -> Result<(), sqlx::Error> {
    let jobs = &options.jobs_table;
    let logs = &options.job_logs_table;
    let results = &options.job_results_table;

    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {jobs} (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                unique_id TEXT,
                message TEXT NOT NULL,
                client TEXT NOT NULL,
                worker TEXT,
                recurring TEXT,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                status TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 2,
                try_count INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                scheduled TEXT NOT NULL,
                acquired TEXT,
                timeout TEXT,
                expire TEXT,
                completed TEXT,
                created TEXT NOT NULL,
                modified TEXT NOT NULL,
                stopwatches TEXT
            )"
        ),
        // Covers the poll predicate and its priority/created ordering.
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{jobs}_poll
             ON {jobs} (status, job_type, priority, created, scheduled, timeout, recurring)"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_{jobs}_unique_id
             ON {jobs} (unique_id) WHERE unique_id IS NOT NULL"
        ),
        // Supports the eviction sweep over terminal jobs.
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{jobs}_completed
             ON {jobs} (completed) WHERE completed IS NOT NULL"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {logs} (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                job_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                created TEXT NOT NULL
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{logs}_job ON {logs} (job_id, created)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{logs}_created ON {logs} (created)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {results} (
                job_id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                message TEXT NOT NULL,
                created TEXT NOT NULL
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{results}_created ON {results} (created)"),
    ];

    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
