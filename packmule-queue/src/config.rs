//! Engine configuration.

use packmule_storage::StorageOptions;

const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_IDLE_SLEEP_MS: u64 = 1000;
const DEFAULT_ACTIVE_SLEEP_MS: u64 = 10;

/// Tunables for one [`JobQueue`](crate::JobQueue) instance.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum jobs in flight across all handlers in this process.
    pub concurrency: usize,
    /// Lease length granted to each claim, in seconds. Handlers may extend
    /// their own lease while running.
    pub timeout_secs: u64,
    /// Sleep between polls when the last tick found nothing.
    pub idle_sleep_ms: u64,
    /// Sleep between polls when the last tick dispatched a job.
    pub active_sleep_ms: u64,
    /// Passed through to the storage driver at connect time.
    pub storage: StorageOptions,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            idle_sleep_ms: DEFAULT_IDLE_SLEEP_MS,
            active_sleep_ms: DEFAULT_ACTIVE_SLEEP_MS,
            storage: StorageOptions::default(),
        }
    }
}

impl QueueConfig {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs.max(1);
        self
    }

    pub fn idle_sleep_ms(mut self, idle_sleep_ms: u64) -> Self {
        self.idle_sleep_ms = idle_sleep_ms;
        self
    }

    pub fn active_sleep_ms(mut self, active_sleep_ms: u64) -> Self {
        self.active_sleep_ms = active_sleep_ms;
        self
    }

    pub fn storage(mut self, storage: StorageOptions) -> Self {
        self.storage = storage;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = QueueConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.idle_sleep_ms, 1000);
        assert_eq!(config.active_sleep_ms, 10);
    }

    #[test]
    fn builders_clamp_zero_values() {
        let config = QueueConfig::default().concurrency(0).timeout_secs(0);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.timeout_secs, 1);
    }
}
