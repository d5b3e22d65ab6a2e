//! Generic workload objects.

use kplane_store::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A workload object of any kind: namespaces, configmaps, services, and
/// negotiated kinds alike.
///
/// `spec` is owned by whoever writes the object upstream; `status` is owned
/// by the component that observes it (the target, via the syncer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl Object {
    pub fn new(kind: &str, metadata: ObjectMeta, spec: Value) -> Self {
        Self {
            kind: kind.to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn namespace(workspace: &str, name: &str) -> Self {
        Self::new(
            crate::kinds::NAMESPACES,
            ObjectMeta::cluster_scoped(workspace, name),
            Value::Null,
        )
    }
}

impl kplane_store::Resource for Object {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn set_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}
