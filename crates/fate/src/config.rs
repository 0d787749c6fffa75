//! Engine configuration.

use std::time::Duration;

/// Configuration for the FATE engine.
#[derive(Debug, Clone)]
pub struct FateConfig {
    /// Delay before a freshly started worker performs its first poll.
    pub poll_initial_delay: Duration,
    /// Lower bound of the idle backoff between polls.
    pub poll_min_interval: Duration,
    /// Upper bound of the idle backoff between polls.
    pub poll_max_interval: Duration,
    /// Number of worker threads. Hot-reloadable via `Fate::resize_pool`.
    pub worker_pool_size: usize,
    /// How long `shutdown` waits for in-flight steps before detaching
    /// their workers.
    pub shutdown_grace: Duration,
}

impl Default for FateConfig {
    fn default() -> Self {
        Self {
            poll_initial_delay: Duration::from_millis(250),
            poll_min_interval: Duration::from_millis(100),
            poll_max_interval: Duration::from_secs(5),
            worker_pool_size: 4,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl FateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_initial_delay(mut self, delay: Duration) -> Self {
        self.poll_initial_delay = delay;
        self
    }

    pub fn with_poll_intervals(mut self, min: Duration, max: Duration) -> Self {
        self.poll_min_interval = min;
        self.poll_max_interval = max;
        self
    }

    pub fn with_worker_pool_size(mut self, workers: usize) -> Self {
        self.worker_pool_size = workers;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
