//! Execution targets: registered physical clusters.

use chrono::{DateTime, Utc};
use kplane_id::TargetKey;
use kplane_store::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::conditions::{self, Condition};
use crate::macros::impl_resource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTarget {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ExecutionTargetSpec,
    #[serde(default)]
    pub status: ExecutionTargetStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTargetSpec {
    /// Resource kinds the target can run, e.g. `services`.
    #[serde(default)]
    pub supported_kinds: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTargetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl_resource!(ExecutionTarget, crate::kinds::EXECUTION_TARGETS);

impl ExecutionTarget {
    pub fn new(workspace: &str, name: &str, supported_kinds: Vec<String>) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(workspace, name),
            spec: ExecutionTargetSpec { supported_kinds },
            status: ExecutionTargetStatus::default(),
        }
    }

    /// The key used in sync-intent labels for this target.
    pub fn target_key(&self) -> TargetKey {
        TargetKey::derive(&self.metadata.workspace, &self.metadata.name)
    }

    pub fn is_ready(&self) -> bool {
        conditions::is_true(&self.status.conditions, conditions::READY)
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.spec.supported_kinds.iter().any(|k| k == kind)
    }
}
