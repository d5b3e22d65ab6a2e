//! kplane control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but exposes its
//! components so the end-to-end suite can run them in-process.

pub mod admission;
pub mod api;
pub mod config;
pub mod liveness;
pub mod location;
pub mod negotiation;
pub mod placement;
pub mod registry;
pub mod state;
pub mod stores;

use std::sync::Arc;

use kplane_reconcile::WorkerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::admission::{AdmissionGate, AllowAll};
use crate::config::Config;
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::location::LocationResolver;
use crate::negotiation::Negotiator;
use crate::placement::PlacementEngine;
use crate::registry::TargetRegistry;
use crate::state::AppState;
use crate::stores::Stores;

/// Every control-plane component over one set of stores.
pub struct ControlPlane {
    config: Config,
    pub stores: Stores,
    pub registry: Arc<TargetRegistry>,
    pub resolver: Arc<LocationResolver>,
    pub placement: Arc<PlacementEngine>,
    pub negotiator: Arc<Negotiator>,
    admission: Arc<dyn AdmissionGate>,
}

impl ControlPlane {
    pub fn new(config: Config, stores: Stores) -> Self {
        Self {
            registry: Arc::new(TargetRegistry::new(stores.targets.clone())),
            resolver: Arc::new(LocationResolver::new(
                stores.locations.clone(),
                stores.targets.clone(),
            )),
            placement: Arc::new(PlacementEngine::new(stores.clone())),
            negotiator: Arc::new(Negotiator::new(stores.clone())),
            admission: Arc::new(AllowAll),
            config,
            stores,
        }
    }

    /// Replace the admission gate consulted on object writes.
    pub fn with_admission(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.admission = gate;
        self
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.stores.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.placement),
            Arc::clone(&self.negotiator),
            Arc::clone(&self.admission),
        )
    }

    fn worker_config(&self, name: &str) -> WorkerConfig {
        WorkerConfig {
            workers: self.config.workers,
            reconcile_timeout: self.config.reconcile_timeout,
            ..WorkerConfig::named(name)
        }
    }

    /// Start the controllers and the liveness monitor. They stop once
    /// `shutdown` flips to true.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let resync = self.config.resync_interval;
        let liveness = LivenessMonitor::new(
            Arc::clone(&self.registry),
            LivenessConfig {
                interval: (self.config.heartbeat_timeout / 4).max(std::time::Duration::from_millis(100)),
                timeout: self.config.heartbeat_timeout,
            },
        );

        vec![
            tokio::spawn(Arc::clone(&self.resolver).run(
                self.worker_config("location-resolver"),
                resync,
                shutdown.clone(),
            )),
            tokio::spawn(Arc::clone(&self.placement).run(
                self.worker_config("placement-engine"),
                resync,
                shutdown.clone(),
            )),
            tokio::spawn(Arc::clone(&self.negotiator).run(
                self.worker_config("negotiator"),
                resync,
                shutdown.clone(),
            )),
            tokio::spawn(async move { liveness.run(shutdown).await }),
        ]
    }
}
