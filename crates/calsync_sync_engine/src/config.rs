//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Timeout for a single remote call.
    pub request_timeout: Duration,
    /// Maximum number of sends in flight at once, each for a distinct entity.
    pub max_concurrent_sends: usize,
    /// Longest the engine sleeps before re-checking the queue.
    pub poll_interval: Duration,
    /// Period of the scheduled pull from the server. `None` disables it.
    pub refresh_interval: Option<Duration>,
    /// Number of rebases after which a conflict becomes terminal.
    pub max_conflict_retries: u32,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_concurrent_sends: 4,
            poll_interval: Duration::from_secs(30),
            refresh_interval: Some(Duration::from_secs(300)),
            max_conflict_retries: 3,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the send concurrency limit. Zero is treated as one.
    pub fn with_max_concurrent_sends(mut self, limit: usize) -> Self {
        self.max_concurrent_sends = limit.max(1);
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Disables the scheduled refresh.
    pub fn without_refresh(mut self) -> Self {
        self.refresh_interval = None;
        self
    }

    /// Sets how many rebases a single mutation may go through.
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
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

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between retries, before jitter.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            add_jitter: true,
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

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Turns jitter on or off.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay after a failed attempt.
    ///
    /// `attempt_count` is the number of failures before this one, so the
    /// first failure waits `initial_delay`.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64()).max(0.0);

        if self.add_jitter && delay_secs > 0.0 {
            // Add up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Backoff for a failed attempt, never shorter than what the server asked for.
    pub fn delay_with_hint(&self, attempt_count: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for_attempt(attempt_count);
        match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}
