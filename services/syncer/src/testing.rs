//! Test doubles for the syncer's collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use kplane_api::wire::{Heartbeat, KindAvailability, Registration, TargetHandle};
use kplane_api::{KindRegistry, ResourceImport};
use kplane_id::{ObjectUid, TargetKey};

use crate::client::ControlPlaneApi;
use crate::error::SyncError;

/// Records every call. Kinds are bound once marked with [`Self::set_usable`];
/// an import counts as merged unless marked with [`Self::set_conflict`].
#[derive(Default)]
pub(crate) struct FakeControlPlane {
    heartbeats: Mutex<Vec<Heartbeat>>,
    imports: Mutex<Vec<ResourceImport>>,
    usable: Mutex<BTreeSet<String>>,
    conflicts: Mutex<BTreeMap<String, String>>,
}

impl FakeControlPlane {
    pub fn heartbeats(&self) -> Vec<Heartbeat> {
        self.heartbeats.lock().unwrap().clone()
    }

    pub fn imports(&self) -> Vec<ResourceImport> {
        self.imports.lock().unwrap().clone()
    }

    pub fn set_usable(&self, kind: &str) {
        self.usable.lock().unwrap().insert(kind.to_string());
    }

    /// Reject this syncer's import of `kind`; `None` accepts it again.
    pub fn set_conflict(&self, kind: &str, conflict: Option<&str>) {
        let mut conflicts = self.conflicts.lock().unwrap();
        match conflict {
            Some(message) => conflicts.insert(kind.to_string(), message.to_string()),
            None => conflicts.remove(kind),
        };
    }
}

#[async_trait]
impl ControlPlaneApi for FakeControlPlane {
    async fn register(&self, registration: &Registration) -> Result<TargetHandle, SyncError> {
        Ok(TargetHandle {
            uid: ObjectUid::new(),
            workspace: registration.workspace.clone(),
            name: registration.name.clone(),
            key: TargetKey::derive(&registration.workspace, &registration.name),
        })
    }

    async fn heartbeat(&self, _uid: &ObjectUid, heartbeat: &Heartbeat) -> Result<(), SyncError> {
        self.heartbeats.lock().unwrap().push(heartbeat.clone());
        Ok(())
    }

    async fn publish_import(&self, import: &ResourceImport) -> Result<(), SyncError> {
        self.imports.lock().unwrap().push(import.clone());
        Ok(())
    }

    async fn kind_availability(
        &self,
        _workspace: &str,
        kind: &str,
        _target_name: &str,
    ) -> Result<KindAvailability, SyncError> {
        let bound = self.usable.lock().unwrap().contains(kind);
        let conflict = self.conflicts.lock().unwrap().get(kind).cloned();
        Ok(KindAvailability {
            kind: kind.to_string(),
            native: KindRegistry::is_native(kind),
            exported: bound,
            bound,
            import_compatible: Some(conflict.is_none()),
            conflict,
        })
    }
}
