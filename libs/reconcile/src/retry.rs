//! Failure tracking and optimistic-concurrency retry.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{BackoffPolicy, RetryableError};

/// Counts consecutive failures per resource inside a sliding window.
///
/// Used to decide when a failure that keeps retrying should also be surfaced
/// for an operator (for example a downstream deletion that never confirms).
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Failures after which a resource counts as exhausted.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource and return the failure count in the
    /// current window.
    pub fn record_failure(&mut self, resource_key: &str) -> u32 {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count >= self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Run a read-modify-write operation, retrying on conflict.
///
/// `op` must re-read current state on every call; a conflict means the
/// resource version it wrote against is stale. Non-conflict errors are
/// returned immediately, as is the last conflict once `attempts` run out.
pub async fn retry_on_conflict<T, E, F, Fut>(
    backoff: &BackoffPolicy,
    attempts: u32,
    mut op: F,
) -> Result<T, E>
where
    E: RetryableError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt + 1 < attempts => {
                let delay = backoff.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "conflict, retrying with fresh read");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
