//! Bounded worker pool over a [`WorkQueue`].

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{ReconcileError, RetryableError, WorkQueue};

/// What a handler wants done with its key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; nothing more to do until the next change.
    Done,

    /// Not converged yet; look again after the delay.
    RequeueAfter(Duration),
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name used in logs.
    pub name: String,

    /// Maximum number of reconciles in flight at once.
    pub workers: usize,

    /// Deadline for a single reconcile.
    pub reconcile_timeout: Duration,

    /// Rate-limited retries before a transiently failing key is requeued
    /// with `requeue_delay` and its backoff reset.
    pub max_retries: u32,

    /// Delay used once `max_retries` is exceeded.
    pub requeue_delay: Duration,
}

impl WorkerConfig {
    /// Defaults for a named controller.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            workers: 4,
            reconcile_timeout: crate::DEFAULT_RECONCILE_TIMEOUT,
            max_retries: crate::DEFAULT_MAX_RETRIES,
            requeue_delay: Duration::from_secs(30),
        }
    }
}

/// Drain `queue` with `config.workers` concurrent workers until `shutdown`
/// flips to true.
///
/// On shutdown the queue stops handing out keys; reconciles already running
/// are allowed to finish (bounded by their deadline). Nothing is lost: state
/// lives in durable objects and the next start re-enqueues everything.
pub async fn run_workers<K, E, F, Fut>(
    queue: WorkQueue<K>,
    config: WorkerConfig,
    handler: F,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    E: RetryableError,
    F: Fn(K) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, E>> + Send + 'static,
{
    info!(
        controller = %config.name,
        workers = config.workers,
        "Starting workers"
    );

    let mut handles = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers.max(1) {
        let queue = queue.clone();
        let handler = handler.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            while let Some(key) = queue.get().await {
                process_one(&queue, &config, &handler, key).await;
            }
            debug!(controller = %config.name, worker_id, "Worker exiting");
        }));
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!(controller = %config.name, "Workers shutting down");
    queue.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
}

async fn process_one<K, E, F, Fut>(queue: &WorkQueue<K>, config: &WorkerConfig, handler: &F, key: K)
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    E: RetryableError,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<Outcome, E>>,
{
    let started = Instant::now();
    let result = tokio::time::timeout(config.reconcile_timeout, handler(key.clone())).await;

    match result {
        Ok(Ok(Outcome::Done)) => {
            queue.forget(&key);
        }
        Ok(Ok(Outcome::RequeueAfter(delay))) => {
            queue.forget(&key);
            queue.add_after(key.clone(), delay);
        }
        Ok(Err(e)) => {
            let retries = queue.num_requeues(&key);
            if e.is_transient() && retries >= config.max_retries {
                warn!(
                    controller = %config.name,
                    ?key,
                    retries,
                    error = %e,
                    "Retries exhausted, requeueing with delay"
                );
                queue.forget(&key);
                queue.add_after(key.clone(), config.requeue_delay);
            } else {
                if e.is_transient() {
                    debug!(controller = %config.name, ?key, retries, error = %e, "Transient reconcile error");
                } else {
                    warn!(controller = %config.name, ?key, retries, error = %e, "Reconcile failed");
                }
                queue.add_rate_limited(key.clone());
            }
        }
        Err(_) => {
            let err = ReconcileError::Timeout {
                resource: format!("{key:?}"),
                elapsed: started.elapsed(),
            };
            warn!(controller = %config.name, error = %err, "Reconcile deadline exceeded");
            queue.add_rate_limited(key.clone());
        }
    }

    queue.done(&key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackoffPolicy;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, thiserror::Error)]
    #[error("flaky")]
    struct Flaky;

    impl RetryableError for Flaky {
        fn is_transient(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_workers_process_keys_and_retry_transient_errors() {
        let queue: WorkQueue<String> =
            WorkQueue::new(BackoffPolicy::fixed(Duration::from_millis(1), Duration::from_millis(5)));
        let attempts: Arc<Mutex<HashMap<String, usize>>> = Arc::default();

        let handler = {
            let attempts = Arc::clone(&attempts);
            move |key: String| {
                let attempts = Arc::clone(&attempts);
                async move {
                    let n = {
                        let mut map = attempts.lock().unwrap();
                        let n = map.entry(key.clone()).or_insert(0);
                        *n += 1;
                        *n
                    };
                    if key == "flaky" && n < 3 {
                        Err(Flaky)
                    } else {
                        Ok(Outcome::Done)
                    }
                }
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        queue.add("steady".to_string());
        queue.add("flaky".to_string());

        let pool = tokio::spawn(run_workers(
            queue.clone(),
            WorkerConfig::named("test"),
            handler,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        pool.await.unwrap();

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts["steady"], 1);
        assert_eq!(attempts["flaky"], 3);
    }

    #[tokio::test]
    async fn test_same_key_never_runs_concurrently() {
        let queue: WorkQueue<u32> = WorkQueue::new(BackoffPolicy::default());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handler = {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            move |_key: u32| {
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Flaky>(Outcome::Done)
                }
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = tokio::spawn(run_workers(
            queue.clone(),
            WorkerConfig::named("serial"),
            handler,
            shutdown_rx,
        ));

        for _ in 0..20 {
            queue.add(7);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        pool.await.unwrap();

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
