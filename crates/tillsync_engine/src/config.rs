//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of items per batch request.
    pub batch_size: usize,
    /// Interval of the periodic background sync.
    pub sync_interval: Duration,
    /// How often the worker polls the connectivity probe.
    pub poll_interval: Duration,
    /// Minimum gap between connectivity-triggered sync attempts.
    /// Debounces a flapping connection.
    pub min_sync_gap: Duration,
    /// Retention window for synced items before garbage collection.
    pub retention: Duration,
    /// Retry behavior for failed items.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with production defaults.
    pub fn new() -> Self {
        Self {
            batch_size: 50,
            sync_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            min_sync_gap: Duration::from_secs(5),
            retention: Duration::from_secs(24 * 60 * 60),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the periodic sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the connectivity poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the minimum gap between connectivity-triggered syncs.
    pub fn with_min_sync_gap(mut self, gap: Duration) -> Self {
        self.min_sync_gap = gap;
        self
    }

    /// Sets the synced-item retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for per-item retry behavior.
///
/// `max_attempts` is the retry ceiling: an item that has failed that
/// many times is excluded from automatic selection until explicitly
/// reset. Below the ceiling, the delay before an item becomes eligible
/// again grows exponentially per attempt.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of automatic attempts per item.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration with the given ceiling.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never retries automatically.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier. A multiplier of 1 gives a fixed
    /// delay between attempts.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter, making delays deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before attempt number `attempt` (1-indexed
    /// by failures: attempt 0 has no delay, attempt 1 waits the initial
    /// delay after the first failure, and so on).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // Exponent capped so parked items (huge retry counts) still
        // compute a finite delay, which the max below bounds anyway.
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter.
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Simple deterministic "jitter" (no external RNG dependency).
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
