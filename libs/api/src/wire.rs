//! Request and response bodies of the control-plane API, shared with its
//! clients.

use std::collections::BTreeMap;

use kplane_id::{ObjectUid, TargetKey};
use serde::{Deserialize, Serialize};

/// What a registering agent declares about its cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub workspace: String,
    pub name: String,
    #[serde(default)]
    pub supported_kinds: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Returned from registration; identifies the target in later calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHandle {
    pub uid: ObjectUid,
    pub workspace: String,
    pub name: String,
    pub key: TargetKey,
}

/// A readiness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Heartbeat {
    pub fn ready() -> Self {
        Self {
            ready: true,
            message: String::new(),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self {
            ready: false,
            message: message.into(),
        }
    }
}

/// Whether a kind can be used in a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindAvailability {
    pub kind: String,
    pub native: bool,
    pub exported: bool,
    pub bound: bool,
    /// Conflict reported by negotiation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<String>,
    /// Verdict on the asking target's own import. `None` until negotiation
    /// has looked at it, or when no target was named.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_compatible: Option<bool>,
}

impl KindAvailability {
    /// Whether the kind can be used in the workspace at all.
    pub fn usable(&self) -> bool {
        self.native || self.bound
    }

    /// Whether a target that imported the kind may sync it. A bound kind is
    /// not enough: the target's own import must have merged into it.
    pub fn usable_by_importer(&self) -> bool {
        self.native || (self.bound && self.import_compatible == Some(true))
    }
}


/// Request to bind a workspace to a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequest {
    pub workspace: String,
    pub location_workspace: String,
    pub location_name: String,
}

/// Body of every list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}
