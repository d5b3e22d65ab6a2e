//! Reconciliation loop primitives.
//!
//! Every controller in kplane is a level-triggered loop: change notifications
//! only enqueue a key, and the handler recomputes desired state from current
//! observed state. Redelivering a key is therefore always safe.
//!
//! - [`WorkQueue`]: deduplicating queue with a per-key in-flight guard and
//!   rate-limited requeue
//! - [`BackoffPolicy`]: exponential backoff with jitter and a cap
//! - [`run_workers`]: bounded worker pool draining a queue under a deadline
//! - [`retry_on_conflict`]: read-modify-write retry for optimistic concurrency
//! - [`forward_events`] and [`resync_every`]: turn watches and timers into
//!   queue adds
//!
//! # Invariants
//!
//! - A key is never handed to two workers at the same time
//! - A key added while it is being processed is processed again afterwards
//! - Backoff delays grow monotonically up to the cap (before jitter)

mod backoff;
mod feed;
mod queue;
mod retry;
mod worker;

pub use backoff::BackoffPolicy;
pub use feed::{forward_events, resync_every};
pub use queue::WorkQueue;
pub use retry::{retry_on_conflict, RetryTracker};
pub use worker::{run_workers, Outcome, WorkerConfig};

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the reconcile primitives themselves.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A reconcile exceeded its deadline.
    #[error("timeout after {elapsed:?} reconciling {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },
}

/// Classification used by the worker pool to pick a retry strategy.
///
/// Transient errors (network, timeout, conflict, not-found-yet, throttling)
/// are retried with backoff and never surfaced as terminal. Everything else
/// is retried too, but the owning controller is expected to have written a
/// status condition explaining why.
pub trait RetryableError: std::error::Error + Send + Sync + 'static {
    /// Whether the error is expected to heal on its own.
    fn is_transient(&self) -> bool;

    /// Whether the error is an optimistic-concurrency conflict.
    fn is_conflict(&self) -> bool {
        false
    }
}

/// Default resync interval for periodic full enqueues.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of rate-limited retries before a key is requeued with a
/// fixed delay instead.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// Attempts for read-modify-write loops before a conflict is returned to the
/// worker pool.
pub const CONFLICT_ATTEMPTS: u32 = 5;

/// Default deadline for a single reconcile.
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);
