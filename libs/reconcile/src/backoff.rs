//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay before jitter.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Policy with no jitter, used where tests need exact delays.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Short policy for re-reading after an optimistic-concurrency conflict.
    pub fn conflict() -> Self {
        Self {
            base: Duration::from_millis(10),
            max: Duration::from_millis(500),
            jitter: 0.25,
        }
    }

    /// Delay before the given retry attempt (0-based), without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.min(32) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);
        Duration::from_millis(delay as u64)
    }

    /// Delay before the given retry attempt (0-based), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.ceiling(attempt).as_millis() as f64;
        if self.jitter <= 0.0 || delay == 0.0 {
            return Duration::from_millis(delay as u64);
        }

        let jitter_range = delay * self.jitter.min(1.0);
        let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}
