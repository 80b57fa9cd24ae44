// ⚙️ Migration configuration
//
// Defaults are tuned for an interactive request (small batches) versus a
// background job (large batches). Every knob can be overridden from the
// environment with the FINANCE_MIGRATION_ prefix.

use std::time::Duration;

const ENV_PREFIX: &str = "FINANCE_MIGRATION_";

// ============================================================================
// RETRY POLICY (link reconciliation)
// ============================================================================

/// Bounded exponential backoff for unresolved cross-references.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failed resolution (default: 3)
    pub max_retries: u32,

    /// Delay before the first retry (default: 1s)
    pub initial_delay: Duration,

    /// Growth factor between retries (default: 2.0)
    pub multiplier: f64,

    /// Upper bound for any single delay (default: 8s)
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
        }
    }

    pub fn with_delays(max_retries: u32, initial_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            initial_delay,
            ..Self::new()
        }
    }

    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MIGRATION CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Batch size for synchronous (caller-waits) requests (default: 20)
    pub sync_batch_size: usize,

    /// Batch size for background jobs (default: 1000)
    pub async_batch_size: usize,

    /// Record count at which expenses switch to the bulk-insert path (default: 10_000)
    pub bulk_threshold: usize,

    /// Parallel batch workers per phase (default: available parallelism)
    pub max_workers: usize,

    /// Attempts for a batch whose unit of work failed (default: 3)
    pub batch_retries: u32,

    /// Pause between batch attempts (default: 200ms)
    pub batch_retry_delay: Duration,

    /// Backoff for unresolved links
    pub link_retry: RetryPolicy,

    /// Recent item descriptions kept per job (default: 25)
    pub recent_items_limit: usize,

    /// How long finished jobs stay pollable (default: 1h)
    pub progress_retention: Duration,
}

impl MigrationConfig {
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        MigrationConfig {
            sync_batch_size: 20,
            async_batch_size: 1000,
            bulk_threshold: 10_000,
            max_workers: workers,
            batch_retries: 3,
            batch_retry_delay: Duration::from_millis(200),
            link_retry: RetryPolicy::new(),
            recent_items_limit: 25,
            progress_retention: Duration::from_secs(60 * 60),
        }
    }

    pub fn with_batch_sizes(mut self, sync_batch_size: usize, async_batch_size: usize) -> Self {
        self.sync_batch_size = sync_batch_size.max(1);
        self.async_batch_size = async_batch_size.max(1);
        self
    }

    pub fn with_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_bulk_threshold(mut self, bulk_threshold: usize) -> Self {
        self.bulk_threshold = bulk_threshold;
        self
    }

    pub fn with_batch_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.batch_retries = retries.max(1);
        self.batch_retry_delay = delay;
        self
    }

    pub fn with_link_retry(mut self, policy: RetryPolicy) -> Self {
        self.link_retry = policy;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.progress_retention = retention;
        self
    }

    /// Defaults overridden by FINANCE_MIGRATION_* environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        let read = |name: &str| -> Option<u64> {
            let key = format!("{}{}", ENV_PREFIX, name);
            let raw = lookup(&key)?;
            match raw.trim().parse::<u64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%key, value = %raw, "ignoring unparseable config value");
                    None
                }
            }
        };

        if let Some(v) = read("SYNC_BATCH_SIZE") {
            config.sync_batch_size = (v as usize).max(1);
        }
        if let Some(v) = read("ASYNC_BATCH_SIZE") {
            config.async_batch_size = (v as usize).max(1);
        }
        if let Some(v) = read("BULK_THRESHOLD") {
            config.bulk_threshold = v as usize;
        }
        if let Some(v) = read("MAX_WORKERS") {
            config.max_workers = (v as usize).max(1);
        }
        if let Some(v) = read("BATCH_RETRIES") {
            config.batch_retries = (v as u32).max(1);
        }
        if let Some(v) = read("LINK_RETRIES") {
            config.link_retry.max_retries = v as u32;
        }
        if let Some(v) = read("LINK_RETRY_DELAY_MS") {
            config.link_retry.initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = read("RETENTION_SECS") {
            config.progress_retention = Duration::from_secs(v);
        }

        config
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::new()
    }
}
