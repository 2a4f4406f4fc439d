use std::time::Duration;

/// Configuration for exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            exponential_base: 2,
        }
    }
}

/// Exponential backoff state for consecutive failures.
///
/// Each call to [`Backoff::next_delay`] returns the delay to wait before the
/// next attempt and grows the following one, capped at `max_delay`.
/// [`Backoff::reset`] returns to `base_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.base_delay;
        Self {
            config,
            current,
            failures: 0,
        }
    }

    pub fn with_delays(base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(BackoffConfig {
            base_delay,
            max_delay,
            ..Default::default()
        })
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.config.max_delay);
        self.current = delay
            .saturating_mul(self.config.exponential_base)
            .min(self.config.max_delay);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// The delay the next failure would produce, without recording one.
    pub fn peek(&self) -> Duration {
        self.current.min(self.config.max_delay)
    }

    pub fn reset(&mut self) {
        self.current = self.config.base_delay;
        self.failures = 0;
    }

    /// Number of consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
