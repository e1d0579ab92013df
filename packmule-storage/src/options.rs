//! Backend configuration shared by all drivers.

const DEFAULT_JOBS_TABLE: &str = "jobs";
const DEFAULT_JOB_LOGS_TABLE: &str = "job_logs";
const DEFAULT_JOB_RESULTS_TABLE: &str = "job_results";
const DEFAULT_TTL_SECS: u64 = 86_400;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Options handed to a [`StorageDriver`](crate::StorageDriver) at connect
/// time.
///
/// Collection/table names are configurable so several queues can share one
/// database. Terminal jobs and log/result rows older than `ttl_secs` are
/// evicted by the backend.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub jobs_table: String,
    pub job_logs_table: String,
    pub job_results_table: String,
    /// Retention for terminal jobs (keyed on `completed`) and for log and
    /// result rows (keyed on `created`).
    pub ttl_secs: u64,
    /// Cadence of the backend's eviction sweep.
    pub sweep_interval_secs: u64,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            jobs_table: DEFAULT_JOBS_TABLE.to_owned(),
            job_logs_table: DEFAULT_JOB_LOGS_TABLE.to_owned(),
            job_results_table: DEFAULT_JOB_RESULTS_TABLE.to_owned(),
            ttl_secs: DEFAULT_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl StorageOptions {
    /// Prefix all three table names, e.g. `with_prefix("mailer")` yields
    /// `mailer_jobs`, `mailer_job_logs`, `mailer_job_results`.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.jobs_table = format!("{prefix}_{DEFAULT_JOBS_TABLE}");
        self.job_logs_table = format!("{prefix}_{DEFAULT_JOB_LOGS_TABLE}");
        self.job_results_table = format!("{prefix}_{DEFAULT_JOB_RESULTS_TABLE}");
        self
    }

    pub fn ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn sweep_interval_secs(mut self, sweep_interval_secs: u64) -> Self {
        self.sweep_interval_secs = sweep_interval_secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = StorageOptions::default();
        assert_eq!(options.jobs_table, "jobs");
        assert_eq!(options.job_logs_table, "job_logs");
        assert_eq!(options.job_results_table, "job_results");
        assert_eq!(options.ttl_secs, 86_400);
    }

    #[test]
    fn prefix_applies_to_all_tables() {
        let options = StorageOptions::default().with_prefix("mailer");
        assert_eq!(options.jobs_table, "mailer_jobs");
        assert_eq!(options.job_logs_table, "mailer_job_logs");
        assert_eq!(options.job_results_table, "mailer_job_results");
    }
}
