//! Making configured kinds syncable.
//!
//! Native kinds are active from the start. Every other configured kind is
//! imported: its schema is read from the target and published as a
//! `ResourceImport`, and the kind is activated once the control plane
//! reports it bound in the target's workspace with this target's import
//! merged. Schemas keep being polled, and a changed one is published again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use kplane_api::kinds::{DEPLOYMENTS, SERVICES};
use kplane_api::{KindRegistry, Object, ResourceImport, StructuralSchema};
use kplane_store::{ObjectKey, Store};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::client::ControlPlaneApi;
use crate::error::SyncError;

/// Kind of the downstream objects that describe non-built-in kinds. Each is
/// named after the kind it describes and holds its structural schema as
/// spec.
pub const SCHEMA_KIND: &str = "customresourcedefinitions";

/// Schemas of the well-known kinds every target serves.
pub fn builtin_schema(kind: &str) -> Option<StructuralSchema> {
    use StructuralSchema as S;

    let labels = || S::Object {
        properties: Default::default(),
    };
    match kind {
        SERVICES => Some(S::object([
            ("type", S::String),
            ("clusterIP", S::String),
            ("clusterIPs", S::array(S::String)),
            ("selector", labels()),
            (
                "ports",
                S::array(S::object([
                    ("name", S::String),
                    ("port", S::Integer),
                    ("targetPort", S::Any),
                    ("protocol", S::String),
                ])),
            ),
        ])),
        DEPLOYMENTS => Some(S::object([
            ("replicas", S::Integer),
            ("selector", S::Any),
            ("template", S::Any),
            ("strategy", S::Any),
        ])),
        _ => None,
    }
}

/// Read the schema of `kind` as the target serves it.
pub async fn discover_schema(
    downstream: &dyn Store<Object>,
    workspace: &str,
    kind: &str,
) -> Result<StructuralSchema, SyncError> {
    if let Some(schema) = builtin_schema(kind) {
        return Ok(schema);
    }

    let key = ObjectKey::cluster_scoped(SCHEMA_KIND, workspace, kind);
    let Some(definition) = downstream.get(&key).await? else {
        return Err(SyncError::Invalid(format!(
            "target does not serve kind {kind}: no {SCHEMA_KIND} object named {kind}"
        )));
    };
    serde_json::from_value(definition.spec)
        .map_err(|e| SyncError::Invalid(format!("malformed schema for {kind}: {e}")))
}

/// Drives the imports of the configured non-native kinds.
pub struct SchemaImporter {
    control_plane: Arc<dyn ControlPlaneApi>,
    downstream: Arc<dyn Store<Object>>,
    kinds: Arc<RwLock<KindRegistry>>,
    target_workspace: String,
    target_name: String,
    downstream_workspace: String,
}

impl SchemaImporter {
    pub fn new(
        control_plane: Arc<dyn ControlPlaneApi>,
        downstream: Arc<dyn Store<Object>>,
        kinds: Arc<RwLock<KindRegistry>>,
        target_workspace: &str,
        target_name: &str,
        downstream_workspace: &str,
    ) -> Self {
        Self {
            control_plane,
            downstream,
            kinds,
            target_workspace: target_workspace.to_string(),
            target_name: target_name.to_string(),
            downstream_workspace: downstream_workspace.to_string(),
        }
    }

    /// Publish imports for `resources` and poll them until shutdown.
    /// `on_active` is called with each kind as it becomes syncable.
    pub async fn run<F>(
        &self,
        resources: &[String],
        poll: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut on_active: F,
    ) where
        F: FnMut(&str),
    {
        let imported: Vec<&String> = resources
            .iter()
            .filter(|kind| !KindRegistry::is_native(kind))
            .collect();
        if imported.is_empty() {
            return;
        }
        let mut pending: BTreeSet<&str> = imported.iter().map(|kind| kind.as_str()).collect();
        let mut published: BTreeMap<&str, StructuralSchema> = BTreeMap::new();
        info!(kinds = ?pending, "Importing kinds");

        let mut ticker = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            for kind in imported.iter().map(|kind| kind.as_str()) {
                match discover_schema(self.downstream.as_ref(), &self.downstream_workspace, kind)
                    .await
                {
                    Ok(schema) if published.get(kind) != Some(&schema) => {
                        if published.contains_key(kind) {
                            info!(%kind, "Target schema changed");
                        }
                        match self.publish_schema(kind, schema.clone()).await {
                            Ok(()) => {
                                published.insert(kind, schema);
                            }
                            Err(e) => {
                                warn!(%kind, error = %e, "Failed to import kind, will retry");
                                continue;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%kind, error = %e, "Failed to read kind schema, will retry");
                        if !published.contains_key(kind) {
                            continue;
                        }
                    }
                }

                if !pending.contains(kind) {
                    continue;
                }
                match self.try_activate(kind).await {
                    Ok(true) => {
                        pending.remove(kind);
                        on_active(kind);
                        if pending.is_empty() {
                            info!("All configured kinds are syncable");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(%kind, error = %e, "Failed to read kind availability"),
                }
            }
        }
    }

    /// Read the schema of `kind` from the target and publish it.
    #[instrument(skip(self))]
    pub async fn publish(&self, kind: &str) -> Result<(), SyncError> {
        let schema =
            discover_schema(self.downstream.as_ref(), &self.downstream_workspace, kind).await?;
        self.publish_schema(kind, schema).await
    }

    async fn publish_schema(&self, kind: &str, schema: StructuralSchema) -> Result<(), SyncError> {
        let import = ResourceImport::new(&self.target_workspace, &self.target_name, kind, schema);
        self.control_plane.publish_import(&import).await?;
        info!(%kind, "Published resource import");
        Ok(())
    }

    /// Activate `kind` if the control plane reports it usable and this
    /// target's own import merged. Returns whether it is active.
    pub async fn try_activate(&self, kind: &str) -> Result<bool, SyncError> {
        let availability = self
            .control_plane
            .kind_availability(&self.target_workspace, kind, &self.target_name)
            .await?;

        if !availability.usable_by_importer() {
            match (&availability.conflict, availability.import_compatible) {
                (Some(conflict), Some(false)) => {
                    warn!(%kind, %conflict, "Import conflicts with the negotiated schema")
                }
                (Some(conflict), _) => warn!(%kind, %conflict, "Kind blocked by schema conflict"),
                (None, _) => debug!(%kind, "Kind not bound yet"),
            }
            return Ok(false);
        }

        self.kinds.write().await.activate(kind);
        info!(%kind, "Kind is now syncable");
        Ok(true)
    }
}
