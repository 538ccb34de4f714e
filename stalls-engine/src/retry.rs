use rand::Rng;
use std::time::Duration;

/// Retry schedule for the optimistic strategy: bounded attempts with
/// exponential backoff and full jitter.
///
/// `max_attempts` counts the first try, so `max_attempts = 3` means at most
/// two retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// When set, each delay is drawn uniformly from `[0, computed delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Upper bound of the delay before retry number `retry` (0-based),
    /// before jitter is applied.
    pub fn ceiling_for_retry(&self, retry: usize) -> Duration {
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }

    /// Delay to sleep before retry number `retry` (0-based).
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let ceiling = self.ceiling_for_retry(retry);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(ms)
    }

    pub fn allows_another_attempt(&self, attempts_made: usize) -> bool {
        attempts_made < self.max_attempts
    }
}
