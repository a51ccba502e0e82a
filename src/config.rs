// Tuning defaults shared across components - single source of truth

use std::time::Duration;

pub struct Defaults;

impl Defaults {
    // Frontier retry policy
    pub const MAX_ATTEMPTS: u32 = 5;
    pub const RETRY_DECAY: f64 = 0.75;
    pub const LEASE_TIMEOUT_SECS: u64 = 60;
    pub const REAPER_INTERVAL_SECS: u64 = 5;

    // Politeness
    pub const MIN_INTERVAL_MS: u64 = 500;
    pub const MAX_CONCURRENT_PER_TARGET: usize = 2;

    // Worker pools
    pub const WORKERS_PER_STAGE: usize = 4;
    pub const PROCESS_TIMEOUT_SECS: u64 = 45;
    pub const IDLE_BACKOFF_BASE_MS: u64 = 50;
    pub const IDLE_BACKOFF_MAX_MS: u64 = 2000;
    pub const QUEUE_POLL_MS: u64 = 200;

    // Pipeline
    pub const QUEUE_CAPACITY: usize = 1024;
    pub const DRAIN_POLL_MS: u64 = 50;
}

/// Retry and lease policy for the frontier.
#[derive(Debug, Clone)]
pub struct FrontierConfig {
    /// Attempts after which a retryable failure becomes terminal.
    pub max_attempts: u32,
    /// Multiplier applied to priority on each retryable failure.
    pub retry_decay: f64,
    /// How long a worker may hold an InFlight claim before it is reclaimed.
    pub lease_timeout: Duration,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            max_attempts: Defaults::MAX_ATTEMPTS,
            retry_decay: Defaults::RETRY_DECAY,
            lease_timeout: Duration::from_secs(Defaults::LEASE_TIMEOUT_SECS),
        }
    }
}

/// Per-target rate and concurrency limits.
#[derive(Debug, Clone)]
pub struct PolitenessConfig {
    pub min_interval: Duration,
    pub max_concurrent_per_target: usize,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(Defaults::MIN_INTERVAL_MS),
            max_concurrent_per_target: Defaults::MAX_CONCURRENT_PER_TARGET,
        }
    }
}

/// Worker pool tuning for one pipeline stage.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// A `process` call exceeding this is treated as a transient failure.
    pub process_timeout: Duration,
    pub idle_backoff_base: Duration,
    pub idle_backoff_max: Duration,
    /// How long a queue-bound worker waits per poll before rechecking shutdown.
    pub queue_poll: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: Defaults::WORKERS_PER_STAGE,
            process_timeout: Duration::from_secs(Defaults::PROCESS_TIMEOUT_SECS),
            idle_backoff_base: Duration::from_millis(Defaults::IDLE_BACKOFF_BASE_MS),
            idle_backoff_max: Duration::from_millis(Defaults::IDLE_BACKOFF_MAX_MS),
            queue_poll: Duration::from_millis(Defaults::QUEUE_POLL_MS),
        }
    }
}

/// Run-level options supplied by the embedding application.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// When true, rebuild the frontier from the record store instead of seeding fresh.
    pub resume: bool,
    /// (payload, priority) pairs used only on a fresh start.
    pub seeds: Vec<(String, f64)>,
    /// Capacity of each inter-stage queue.
    pub queue_capacity: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            resume: false,
            seeds: Vec::new(),
            queue_capacity: Defaults::QUEUE_CAPACITY,
        }
    }
}
