//! The set of stores the control plane reads and writes.

use std::sync::Arc;

use kplane_api::{
    Binding, ExecutionTarget, Export, Location, NegotiatedResource, Object, Placement,
    ResourceImport,
};
use kplane_store::{MemoryStore, Store};

#[derive(Clone)]
pub struct Stores {
    pub targets: Arc<dyn Store<ExecutionTarget>>,
    pub locations: Arc<dyn Store<Location>>,
    pub placements: Arc<dyn Store<Placement>>,
    pub imports: Arc<dyn Store<ResourceImport>>,
    pub negotiated: Arc<dyn Store<NegotiatedResource>>,
    pub exports: Arc<dyn Store<Export>>,
    pub bindings: Arc<dyn Store<Binding>>,
    /// Workload objects of every kind, namespaces included.
    pub objects: Arc<dyn Store<Object>>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            targets: Arc::new(MemoryStore::new()),
            locations: Arc::new(MemoryStore::new()),
            placements: Arc::new(MemoryStore::new()),
            imports: Arc::new(MemoryStore::new()),
            negotiated: Arc::new(MemoryStore::new()),
            exports: Arc::new(MemoryStore::new()),
            bindings: Arc::new(MemoryStore::new()),
            objects: Arc::new(MemoryStore::new()),
        }
    }
}
