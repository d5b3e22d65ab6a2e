//! Locations: named groups of execution targets.

use kplane_store::{LabelSelector, ObjectMeta, SelectorError};
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::macros::impl_resource;
use crate::ExecutionTarget;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LocationSpec,
    #[serde(default)]
    pub status: LocationStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSpec {
    /// Label selector over targets in the location's workspace. Kept as
    /// text so a malformed selector can be stored and reported.
    #[serde(default)]
    pub instance_selector: String,

    /// Kinds a target must support to be a member.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_kinds: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationStatus {
    /// Ready, matching targets. `None` until the selector was valid once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_instances: Option<u32>,

    /// Names of the ready, matching targets, sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl_resource!(Location, crate::kinds::LOCATIONS);

impl Location {
    pub fn new(workspace: &str, name: &str, instance_selector: &str) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(workspace, name),
            spec: LocationSpec {
                instance_selector: instance_selector.to_string(),
                required_kinds: Vec::new(),
            },
            status: LocationStatus::default(),
        }
    }

    pub fn with_required_kinds(mut self, kinds: &[&str]) -> Self {
        self.spec.required_kinds = kinds.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn selector(&self) -> Result<LabelSelector, SelectorError> {
        LabelSelector::parse(&self.spec.instance_selector)
    }

    pub fn available(&self) -> u32 {
        self.status.available_instances.unwrap_or(0)
    }
}

impl LocationSpec {
    /// Whether `target` is a member, ignoring readiness.
    ///
    /// Pure: only the target's workspace, labels, and supported kinds are
    /// consulted.
    pub fn selects(
        &self,
        location_workspace: &str,
        selector: &LabelSelector,
        target: &ExecutionTarget,
    ) -> bool {
        target.metadata.workspace == location_workspace
            && selector.matches(&target.metadata.labels)
            && self.required_kinds.iter().all(|k| target.supports(k))
    }

    /// Whether `target` counts towards available instances.
    pub fn admits(
        &self,
        location_workspace: &str,
        selector: &LabelSelector,
        target: &ExecutionTarget,
    ) -> bool {
        target.is_ready() && !target.metadata.is_terminating()
            && self.selects(location_workspace, selector, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{self, ConditionStatus};

    fn target(name: &str, env: &str, ready: bool) -> ExecutionTarget {
        let mut target = ExecutionTarget::new("root:org", name, vec!["services".into()]);
        target.metadata.labels.insert("env".into(), env.into());
        let status = if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        conditions::set(
            &mut target.status.conditions,
            Condition::new(conditions::READY, status),
        );
        target
    }

    #[test]
    fn test_admits_ready_matching_targets_only() {
        let location = Location::new("root:org", "prod", "env=prod").with_required_kinds(&["services"]);
        let selector = location.selector().unwrap();
        let spec = &location.spec;

        assert!(spec.admits("root:org", &selector, &target("a", "prod", true)));
        assert!(!spec.admits("root:org", &selector, &target("b", "prod", false)));
        assert!(!spec.admits("root:org", &selector, &target("c", "dev", true)));
        assert!(!spec.admits("root:other", &selector, &target("a", "prod", true)));

        let mut no_services = target("d", "prod", true);
        no_services.spec.supported_kinds.clear();
        assert!(!spec.admits("root:org", &selector, &no_services));
    }

    #[test]
    fn test_malformed_selector_is_reported() {
        let location = Location::new("root:org", "broken", "env in prod");
        assert!(location.selector().is_err());
    }
}
