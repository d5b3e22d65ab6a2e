//! Placements: a workspace bound to a location.

use kplane_id::{ObjectUid, TargetKey};
use kplane_store::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::macros::impl_resource;

/// Every workspace has at most one placement, with this name.
pub const PLACEMENT_NAME: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub metadata: ObjectMeta,
    pub spec: PlacementSpec,
    #[serde(default)]
    pub status: PlacementStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    pub location_workspace: String,
    pub location_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementPhase {
    /// No eligible target has been found yet.
    #[default]
    Pending,
    /// At least one eligible target; one is selected.
    Bound,
    /// The location stopped yielding eligible targets.
    Unbound,
}

impl std::fmt::Display for PlacementPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlacementPhase::Pending => "Pending",
            PlacementPhase::Bound => "Bound",
            PlacementPhase::Unbound => "Unbound",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedTarget {
    pub name: String,
    pub uid: ObjectUid,
    pub key: TargetKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementStatus {
    #[serde(default)]
    pub phase: PlacementPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_target: Option<SelectedTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl_resource!(Placement, crate::kinds::PLACEMENTS);

impl Placement {
    pub fn new(workspace: &str, location_workspace: &str, location_name: &str) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(workspace, PLACEMENT_NAME),
            spec: PlacementSpec {
                location_workspace: location_workspace.to_string(),
                location_name: location_name.to_string(),
            },
            status: PlacementStatus::default(),
        }
    }
}

/// Value of the namespace placement annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementDecision {
    pub location_workspace: String,
    pub location: String,
    pub target: String,
    pub target_key: TargetKey,
}

impl PlacementDecision {
    pub fn to_annotation(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_annotation(value: &str) -> Option<Self> {
        serde_json::from_str(value).ok()
    }
}
