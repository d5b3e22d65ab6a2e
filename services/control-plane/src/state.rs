//! Application state shared across request handlers.

use std::sync::Arc;

use crate::admission::{AdmissionGate, AllowAll};
use crate::negotiation::Negotiator;
use crate::placement::PlacementEngine;
use crate::registry::TargetRegistry;
use crate::stores::Stores;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    stores: Stores,
    registry: Arc<TargetRegistry>,
    placement: Arc<PlacementEngine>,
    negotiator: Arc<Negotiator>,
    admission: Arc<dyn AdmissionGate>,
}

impl AppState {
    pub fn new(
        stores: Stores,
        registry: Arc<TargetRegistry>,
            placement: Arc<PlacementEngine>,
        negotiator: Arc<Negotiator>,
        admission: Arc<dyn AdmissionGate>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                stores,
                registry,
                placement,
                negotiator,
                admission,
            }),
        }
    }

    /// State over fresh in-memory stores with an admission gate that allows
    /// everything. Nothing is running; used by handler tests.
    pub fn in_memory() -> Self {
        let stores = Stores::in_memory();
        Self::new(
            stores.clone(),
            Arc::new(TargetRegistry::new(stores.targets.clone())),
            Arc::new(PlacementEngine::new(stores.clone())),
            Arc::new(Negotiator::new(stores.clone())),
            Arc::new(AllowAll),
        )
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.inner.registry
    }

    pub fn placement(&self) -> &PlacementEngine {
        &self.inner.placement
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.inner.negotiator
    }

    pub fn admission(&self) -> &dyn AdmissionGate {
        self.inner.admission.as_ref()
    }
}
