//! Heartbeat liveness monitor.
//!
//! Periodically flips ready targets whose last heartbeat is older than the
//! timeout to `NotReady`. A flip goes through the registry, so it reaches
//! the resolver and placement engine like any other registry change.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::registry::{RegistryError, TargetRegistry};

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// How often to look for stale targets.
    pub interval: Duration,
    /// Heartbeat age after which a ready target is marked `NotReady`.
    pub timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(40),
        }
    }
}

pub struct LivenessMonitor {
    registry: Arc<TargetRegistry>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<TargetRegistry>, config: LivenessConfig) -> Self {
        Self { registry, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Starting liveness monitor"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_once(Utc::now()).await {
                        error!(error = %e, "Liveness check failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Liveness monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Mark every ready target with a heartbeat older than the timeout as of
    /// `now`. Returns how many targets were flipped.
    pub async fn check_once(&self, now: DateTime<Utc>) -> Result<usize, RegistryError> {
        let timeout = chrono::Duration::from_std(self.config.timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX);

        let mut flipped = 0;
        for target in self.registry.list(None).await? {
            if !target.is_ready() {
                continue;
            }
            let Some(uid) = target.metadata.uid else {
                continue;
            };
            let last = target.status.last_heartbeat;
            let stale = match last {
                Some(at) => now.signed_duration_since(at) > timeout,
                None => true,
            };
            if !stale {
                continue;
            }

            let message = format!("no heartbeat for more than {}s", self.config.timeout.as_secs());
            match self.registry.mark_not_ready(&uid, last, &message).await {
                Ok(true) => flipped += 1,
                Ok(false) => {}
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => warn!(%uid, error = %e, "Failed to mark target not ready"),
            }
        }

        if flipped > 0 {
            info!(flipped, "Stale targets marked not ready");
        }
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kplane_api::wire::{Heartbeat, Registration};
    use kplane_store::MemoryStore;

    fn monitor() -> (Arc<TargetRegistry>, LivenessMonitor) {
        let registry = Arc::new(TargetRegistry::new(Arc::new(MemoryStore::new())));
        let monitor = LivenessMonitor::new(
            Arc::clone(&registry),
            LivenessConfig {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(40),
            },
        );
        (registry, monitor)
    }

    async fn ready_target(registry: &TargetRegistry, name: &str) -> kplane_id::ObjectUid {
        let handle = registry
            .register(Registration {
                workspace: "root:org".into(),
                name: name.into(),
                supported_kinds: Vec::new(),
                labels: Default::default(),
            })
            .await
            .unwrap();
        registry
            .heartbeat(&handle.uid, Heartbeat::ready())
            .await
            .unwrap();
        handle.uid
    }

    #[tokio::test]
    async fn test_fresh_targets_stay_ready() {
        let (registry, monitor) = monitor();
        let uid = ready_target(&registry, "cluster-a").await;

        assert_eq!(monitor.check_once(Utc::now()).await.unwrap(), 0);
        assert!(registry.get(&uid).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_stale_targets_are_flipped_once() {
        let (registry, monitor) = monitor();
        let uid = ready_target(&registry, "cluster-a").await;
        let later = Utc::now() + chrono::Duration::seconds(41);

        assert_eq!(monitor.check_once(later).await.unwrap(), 1);
        let target = registry.get(&uid).await.unwrap();
        assert!(!target.is_ready());

        assert_eq!(monitor.check_once(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_flipped_target() {
        let (registry, monitor) = monitor();
        let uid = ready_target(&registry, "cluster-a").await;
        monitor
            .check_once(Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        registry
            .heartbeat(&uid, Heartbeat::ready())
            .await
            .unwrap();
        assert!(registry.get(&uid).await.unwrap().is_ready());
    }
}
