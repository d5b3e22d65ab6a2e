//! # kplane-api
//!
//! Resource types shared by the control plane and the syncer.
//!
//! ## Resources
//!
//! | Kind | Type | Owner |
//! |------|------|-------|
//! | `executiontargets` | [`ExecutionTarget`] | the registering syncer |
//! | `locations` | [`Location`] | operator (spec), location resolver (status) |
//! | `placements` | [`Placement`] | workspace owner (spec), placement engine (status) |
//! | `resourceimports` | [`ResourceImport`] | syncer |
//! | `negotiatedresources` | [`NegotiatedResource`] | negotiator |
//! | `exports` / `bindings` | [`Export`] / [`Binding`] | negotiator, placement engine |
//! | anything else | [`Object`] | workspace users (spec), syncer (status) |
//!
//! Workload objects carry their sync intent in labels, see [`intent`].

pub mod conditions;
pub mod intent;
pub mod labels;
mod location;
mod macros;
mod namespace;
mod negotiation;
mod object;
mod placement;
pub mod schema;
mod syncable;
mod target;
pub mod wire;

pub use conditions::{Condition, ConditionStatus};
pub use intent::{IntentState, IntentTransition, TransitionError};
pub use location::{Location, LocationSpec, LocationStatus};
pub use namespace::NamespaceLocator;
pub use negotiation::{
    Binding, BindingSpec, Export, ExportSpec, NegotiatedResource, NegotiatedResourceSpec,
    NegotiatedResourceStatus, ResourceImport, ResourceImportSpec, ResourceImportStatus,
};
pub use object::Object;
pub use placement::{
    Placement, PlacementDecision, PlacementPhase, PlacementSpec, PlacementStatus, SelectedTarget,
    PLACEMENT_NAME,
};
pub use schema::{SchemaConflict, StructuralSchema};
pub use syncable::{KindRegistry, Syncable};
pub use target::{ExecutionTarget, ExecutionTargetSpec, ExecutionTargetStatus};

/// Resource kind names.
pub mod kinds {
    pub const EXECUTION_TARGETS: &str = "executiontargets";
    pub const LOCATIONS: &str = "locations";
    pub const PLACEMENTS: &str = "placements";
    pub const RESOURCE_IMPORTS: &str = "resourceimports";
    pub const NEGOTIATED_RESOURCES: &str = "negotiatedresources";
    pub const EXPORTS: &str = "exports";
    pub const BINDINGS: &str = "bindings";

    pub const NAMESPACES: &str = "namespaces";
    pub const CONFIGMAPS: &str = "configmaps";
    pub const SECRETS: &str = "secrets";
    pub const SERVICES: &str = "services";
    pub const DEPLOYMENTS: &str = "deployments";
}
