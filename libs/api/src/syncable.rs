//! Per-kind sync capabilities.
//!
//! The syncer never inspects object kinds directly. It asks the
//! [`KindRegistry`] for the kind's [`Syncable`] and goes through that for
//! everything kind-specific: where status lives and which downstream spec
//! fields must survive an update.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::kinds::{CONFIGMAPS, DEPLOYMENTS, NAMESPACES, SECRETS, SERVICES};
use crate::Object;

/// Kinds every workspace recognises without negotiation.
const NATIVE_KINDS: &[&str] = &[NAMESPACES, CONFIGMAPS, SECRETS];

pub trait Syncable: Send + Sync {
    fn kind(&self) -> &str;

    fn spec<'a>(&self, obj: &'a Object) -> &'a Value {
        &obj.spec
    }

    /// Observed status, `None` for kinds without one.
    fn status<'a>(&self, obj: &'a Object) -> Option<&'a Value> {
        obj.status.as_ref()
    }

    fn set_status(&self, obj: &mut Object, status: Option<Value>) {
        obj.status = status;
    }

    /// Whether status flows back upstream at all.
    fn has_status(&self) -> bool {
        true
    }

    /// Spec to write downstream, given the spec already there.
    fn downstream_spec(&self, upstream: &Value, _existing: Option<&Value>) -> Value {
        upstream.clone()
    }
}

/// Data-only kinds: configmaps and secrets.
struct DataOnly(&'static str);

impl Syncable for DataOnly {
    fn kind(&self) -> &str {
        self.0
    }

    fn status<'a>(&self, _obj: &'a Object) -> Option<&'a Value> {
        None
    }

    fn set_status(&self, _obj: &mut Object, _status: Option<Value>) {}

    fn has_status(&self) -> bool {
        false
    }
}

/// Services keep the cluster IPs the target allocated.
struct Service;

const SERVICE_ALLOCATED_FIELDS: &[&str] = &["clusterIP", "clusterIPs"];

impl Syncable for Service {
    fn kind(&self) -> &str {
        SERVICES
    }

    fn downstream_spec(&self, upstream: &Value, existing: Option<&Value>) -> Value {
        let mut spec = upstream.clone();
        if let (Some(Value::Object(existing)), Value::Object(fields)) = (existing, &mut spec) {
            for field in SERVICE_ALLOCATED_FIELDS {
                let unset = !matches!(fields.get(*field), Some(v) if !v.is_null());
                if let (true, Some(allocated)) = (unset, existing.get(*field)) {
                    fields.insert(field.to_string(), allocated.clone());
                }
            }
        }
        spec
    }
}

/// Kinds with a plain spec/status split: deployments and negotiated kinds.
struct WithStatus(String);

impl Syncable for WithStatus {
    fn kind(&self) -> &str {
        &self.0
    }
}

/// Kinds this process can sync.
#[derive(Clone)]
pub struct KindRegistry {
    kinds: BTreeMap<String, Arc<dyn Syncable>>,
}

impl KindRegistry {
    /// Registry with the native workload kinds active.
    pub fn new() -> Self {
        let mut registry = Self {
            kinds: BTreeMap::new(),
        };
        for kind in NATIVE_KINDS.iter().filter(|k| **k != NAMESPACES) {
            registry.activate(kind);
        }
        registry
    }

    /// Whether `kind` is recognised without negotiation.
    pub fn is_native(kind: &str) -> bool {
        NATIVE_KINDS.contains(&kind)
    }

    /// Make `kind` syncable, typically after it was negotiated.
    pub fn activate(&mut self, kind: &str) {
        let syncable: Arc<dyn Syncable> = match kind {
            CONFIGMAPS => Arc::new(DataOnly(CONFIGMAPS)),
            SECRETS => Arc::new(DataOnly(SECRETS)),
            SERVICES => Arc::new(Service),
            DEPLOYMENTS => Arc::new(WithStatus(DEPLOYMENTS.to_string())),
            other => Arc::new(WithStatus(other.to_string())),
        };
        self.kinds.insert(kind.to_string(), syncable);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Syncable>> {
        self.kinds.get(kind).cloned()
    }

    pub fn is_active(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kplane_store::ObjectMeta;
    use serde_json::json;

    #[test]
    fn test_native_kinds() {
        let registry = KindRegistry::new();
        assert!(registry.is_active("configmaps"));
        assert!(registry.is_active("secrets"));
        assert!(!registry.is_active("services"));
        assert!(!registry.is_active("namespaces"));
        assert!(KindRegistry::is_native("namespaces"));
        assert!(!KindRegistry::is_native("services"));
    }

    #[test]
    fn test_configmaps_have_no_status() {
        let registry = KindRegistry::new();
        let syncable = registry.get("configmaps").unwrap();
        let mut obj = Object::new(
            "configmaps",
            ObjectMeta::namespaced("root:org", "default", "cfg"),
            json!({"data": {"k": "v"}}),
        );

        syncable.set_status(&mut obj, Some(json!({"phase": "x"})));
        assert!(obj.status.is_none());
        assert!(!syncable.has_status());
    }

    #[test]
    fn test_service_keeps_allocated_cluster_ip() {
        let mut registry = KindRegistry::new();
        registry.activate("services");
        let syncable = registry.get("services").unwrap();

        let upstream = json!({"ports": [{"port": 80}]});
        let downstream = json!({"ports": [{"port": 80}], "clusterIP": "10.0.0.7", "clusterIPs": ["10.0.0.7"]});

        let spec = syncable.downstream_spec(&upstream, Some(&downstream));
        assert_eq!(spec, downstream);

        let first = syncable.downstream_spec(&upstream, None);
        assert_eq!(first, upstream);
    }

    #[test]
    fn test_negotiated_kind_copies_status() {
        let mut registry = KindRegistry::new();
        registry.activate("widgets");
        let syncable = registry.get("widgets").unwrap();
        let mut obj = Object::new(
            "widgets",
            ObjectMeta::namespaced("root:org", "default", "w"),
            json!({}),
        );
        syncable.set_status(&mut obj, Some(json!({"ready": true})));
        assert_eq!(syncable.status(&obj), Some(&json!({"ready": true})));
    }
}
