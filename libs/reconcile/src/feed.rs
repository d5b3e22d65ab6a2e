//! Feeding change notifications into work queues.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Call `on_event` for every event received on `events` until shutdown.
///
/// Lagging behind the channel drops events; the periodic resync covers for
/// them since every handler is level-triggered.
pub async fn forward_events<T, F, Fut>(
    controller: &'static str,
    mut events: broadcast::Receiver<T>,
    mut shutdown: watch::Receiver<bool>,
    mut on_event: F,
) where
    T: Clone,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => on_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(controller, skipped, "Watch lagged, waiting for resync");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(controller, "Event forwarding stopped");
}

/// Call `resync` every `interval` until shutdown, starting immediately.
pub async fn resync_every<F, Fut>(
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut resync: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => resync().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
