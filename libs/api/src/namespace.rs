//! Upstream to downstream namespace mapping.

use kplane_id::{digest_base36, TargetKey};
use serde::{Deserialize, Serialize};

const DOWNSTREAM_PREFIX: &str = "kplane-";

/// Identifies the upstream origin of a downstream namespace.
///
/// Objects from different workspaces that share a namespace name land in
/// different downstream namespaces, so mirrors never collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceLocator {
    pub workspace: String,
    pub namespace: String,
    pub target_key: TargetKey,
}

impl NamespaceLocator {
    pub fn new(workspace: &str, namespace: &str, target_key: &TargetKey) -> Self {
        Self {
            workspace: workspace.to_string(),
            namespace: namespace.to_string(),
            target_key: target_key.clone(),
        }
    }

    /// Name of the downstream namespace; a valid DNS label.
    pub fn downstream_namespace(&self) -> String {
        format!("{DOWNSTREAM_PREFIX}{}", digest_base36(self.to_annotation().as_bytes()))
    }

    pub fn to_annotation(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_annotation(value: &str) -> Option<Self> {
        serde_json::from_str(value).ok()
    }
}
