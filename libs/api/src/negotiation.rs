//! Schema import chain: `ResourceImport` → `NegotiatedResource` →
//! `Export` + `Binding`.

use kplane_store::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::macros::impl_resource;
use crate::StructuralSchema;

/// A kind's schema as observed on one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceImport {
    pub metadata: ObjectMeta,
    pub spec: ResourceImportSpec,
    #[serde(default)]
    pub status: ResourceImportStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceImportSpec {
    pub kind: String,
    pub target_name: String,
    pub schema: StructuralSchema,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceImportStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl_resource!(ResourceImport, crate::kinds::RESOURCE_IMPORTS);

impl ResourceImport {
    /// Imports are named `<kind>.<target>`, one per kind and target.
    pub fn new(workspace: &str, target_name: &str, kind: &str, schema: StructuralSchema) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(workspace, format!("{kind}.{target_name}")),
            spec: ResourceImportSpec {
                kind: kind.to_string(),
                target_name: target_name.to_string(),
                schema,
            },
            status: ResourceImportStatus::default(),
        }
    }
}

/// A kind's schema merged across every importing target. Named after the
/// kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiatedResource {
    pub metadata: ObjectMeta,
    pub spec: NegotiatedResourceSpec,
    #[serde(default)]
    pub status: NegotiatedResourceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedResourceSpec {
    pub kind: String,
    /// Last compatible merge, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<StructuralSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedResourceStatus {
    /// Names of the imports that contributed to the schema.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl_resource!(NegotiatedResource, crate::kinds::NEGOTIATED_RESOURCES);

impl NegotiatedResource {
    pub fn new(workspace: &str, kind: &str) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(workspace, kind),
            spec: NegotiatedResourceSpec {
                kind: kind.to_string(),
                schema: None,
            },
            status: NegotiatedResourceStatus::default(),
        }
    }
}

/// Exposes a negotiated kind. Named after the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
    pub metadata: ObjectMeta,
    pub spec: ExportSpec,
    #[serde(skip)]
    pub status: (),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSpec {
    pub kind: String,
    pub schema: StructuralSchema,
}

impl_resource!(Export, crate::kinds::EXPORTS);

impl Export {
    pub fn new(workspace: &str, kind: &str, schema: StructuralSchema) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(workspace, kind),
            spec: ExportSpec {
                kind: kind.to_string(),
                schema,
            },
            status: (),
        }
    }
}

/// Makes an exported kind usable in the binding's workspace. Named after
/// the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub metadata: ObjectMeta,
    pub spec: BindingSpec,
    #[serde(skip)]
    pub status: (),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    pub kind: String,
    pub export_workspace: String,
    pub export_name: String,
}

impl_resource!(Binding, crate::kinds::BINDINGS);

impl Binding {
    pub fn new(workspace: &str, export: &Export) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(workspace, export.spec.kind.clone()),
            spec: BindingSpec {
                kind: export.spec.kind.clone(),
                export_workspace: export.metadata.workspace.clone(),
                export_name: export.metadata.name.clone(),
            },
            status: (),
        }
    }
}
