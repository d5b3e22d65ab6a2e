//! Heartbeat loop reporting target readiness to the control plane.
//!
//! The target counts as ready only while its object API answers; each beat
//! checks it by listing the namespaces of the downstream workspace.

use std::sync::Arc;
use std::time::Duration;

use kplane_api::kinds::NAMESPACES;
use kplane_api::wire::Heartbeat;
use kplane_api::Object;
use kplane_id::ObjectUid;
use kplane_store::{ListQuery, Store};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlaneApi;
use crate::error::SyncError;

pub struct HeartbeatLoop {
    control_plane: Arc<dyn ControlPlaneApi>,
    downstream: Arc<dyn Store<Object>>,
    downstream_workspace: String,
    uid: ObjectUid,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(
        control_plane: Arc<dyn ControlPlaneApi>,
        downstream: Arc<dyn Store<Object>>,
        downstream_workspace: &str,
        uid: ObjectUid,
        interval: Duration,
    ) -> Self {
        Self {
            control_plane,
            downstream,
            downstream_workspace: downstream_workspace.to_string(),
            uid,
            interval,
        }
    }

    /// Run until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            uid = %self.uid,
            interval_secs = self.interval.as_secs(),
            "Starting heartbeat loop"
        );

        let mut consecutive_failures = 0u32;
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.beat_once().await {
                    Ok(beat) => {
                        consecutive_failures = 0;
                        debug!(ready = beat.ready, "Heartbeat acknowledged");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Heartbeat failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Heartbeat failed repeatedly");
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Heartbeat loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe the target and report the result. Returns what was reported.
    pub async fn beat_once(&self) -> Result<Heartbeat, SyncError> {
        let beat = self.observe().await;
        self.control_plane.heartbeat(&self.uid, &beat).await?;
        Ok(beat)
    }

    async fn observe(&self) -> Heartbeat {
        let query = ListQuery::all()
            .kind(NAMESPACES)
            .workspace(self.downstream_workspace.as_str());
        match self.downstream.list(&query).await {
            Ok(_) => Heartbeat::ready(),
            Err(e) => Heartbeat::not_ready(format!("target API unreachable: {e}")),
        }
    }
}
