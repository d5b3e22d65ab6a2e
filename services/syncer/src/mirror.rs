//! Mapping between upstream objects and their downstream mirrors.

use kplane_api::labels::{
    is_deletion_stuck_annotation, CLUSTER_LABEL, NAMESPACE_LOCATOR_ANNOTATION,
    SOURCE_NAMESPACE_ANNOTATION, SOURCE_NAME_ANNOTATION, SOURCE_WORKSPACE_ANNOTATION,
};
use kplane_api::{intent, NamespaceLocator, Object, Syncable};
use kplane_id::TargetKey;
use kplane_store::{ObjectKey, ObjectMeta};

/// Where the mirrors of one target live.
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    pub target_key: TargetKey,
    /// Workspace on the target that mirrors are written to.
    pub workspace: String,
}

impl MirrorLayout {
    pub fn new(target_key: TargetKey, workspace: &str) -> Self {
        Self {
            target_key,
            workspace: workspace.to_string(),
        }
    }

    /// Downstream namespace for an upstream namespace; empty for
    /// cluster-scoped objects.
    pub fn namespace_for(&self, upstream_workspace: &str, upstream_namespace: &str) -> String {
        if upstream_namespace.is_empty() {
            return String::new();
        }
        NamespaceLocator::new(upstream_workspace, upstream_namespace, &self.target_key)
            .downstream_namespace()
    }

    /// Key of the mirror of the upstream object at `upstream`.
    pub fn mirror_key(&self, upstream: &ObjectKey) -> ObjectKey {
        ObjectKey::new(
            upstream.kind.clone(),
            self.workspace.clone(),
            self.namespace_for(&upstream.workspace, &upstream.namespace),
            upstream.name.clone(),
        )
    }

    /// The downstream namespace object holding mirrors of `upstream_namespace`.
    pub fn namespace_object(&self, upstream_workspace: &str, upstream_namespace: &str) -> Object {
        let locator =
            NamespaceLocator::new(upstream_workspace, upstream_namespace, &self.target_key);
        let mut ns = Object::namespace(&self.workspace, &locator.downstream_namespace());
        ns.metadata
            .annotations
            .insert(NAMESPACE_LOCATOR_ANNOTATION.to_string(), locator.to_annotation());
        ns
    }

    /// Desired mirror of `upstream`, on top of the mirror already there.
    ///
    /// Intent labels, finalizers and identity are not carried over; the
    /// provenance label and source annotations are added. Status is left as
    /// the target reported it.
    pub fn desired_mirror(
        &self,
        upstream: &Object,
        syncable: &dyn Syncable,
        existing: Option<&Object>,
    ) -> Object {
        let source = &upstream.metadata;
        let mut meta = match existing {
            Some(existing) => existing.metadata.clone(),
            None => ObjectMeta {
                name: source.name.clone(),
                namespace: self.namespace_for(&source.workspace, &source.namespace),
                workspace: self.workspace.clone(),
                ..ObjectMeta::default()
            },
        };

        meta.labels = source
            .labels
            .iter()
            .filter(|(k, _)| !intent::is_intent_label(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        meta.labels
            .insert(CLUSTER_LABEL.to_string(), self.target_key.to_string());

        meta.annotations = source
            .annotations
            .iter()
            .filter(|(k, _)| !is_deletion_stuck_annotation(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        meta.annotations
            .insert(SOURCE_WORKSPACE_ANNOTATION.to_string(), source.workspace.clone());
        meta.annotations
            .insert(SOURCE_NAMESPACE_ANNOTATION.to_string(), source.namespace.clone());
        meta.annotations
            .insert(SOURCE_NAME_ANNOTATION.to_string(), source.name.clone());

        let spec = syncable.downstream_spec(syncable.spec(upstream), existing.map(|e| &e.spec));

        Object {
            kind: upstream.kind.clone(),
            metadata: meta,
            spec,
            status: existing.and_then(|e| e.status.clone()),
        }
    }

    /// Whether `mirror` belongs to this target.
    pub fn owns(&self, mirror: &Object) -> bool {
        mirror.metadata.labels.get(CLUSTER_LABEL).map(String::as_str)
            == Some(self.target_key.as_str())
    }
}

/// Upstream key a mirror was copied from, read from its source annotations.
pub fn upstream_key_of(mirror: &Object) -> Option<ObjectKey> {
    let annotations = &mirror.metadata.annotations;
    Some(ObjectKey::new(
        mirror.kind.clone(),
        annotations.get(SOURCE_WORKSPACE_ANNOTATION)?.clone(),
        annotations.get(SOURCE_NAMESPACE_ANNOTATION)?.clone(),
        annotations.get(SOURCE_NAME_ANNOTATION)?.clone(),
    ))
}

/// Whether writing `desired` over `existing` would change anything the
/// syncer owns.
pub fn needs_update(existing: &Object, desired: &Object) -> bool {
    existing.spec != desired.spec
        || existing.metadata.labels != desired.metadata.labels
        || existing.metadata.annotations != desired.metadata.annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use kplane_api::labels::{deletion_stuck_annotation, intent_label};
    use kplane_api::KindRegistry;
    use kplane_store::Resource;
    use kplane_testing::workload;
    use serde_json::json;

    fn layout() -> MirrorLayout {
        MirrorLayout::new(TargetKey::derive("root:org", "cluster-a"), "root:org:cluster-a")
    }

    fn placed(name: &str) -> Object {
        let mut obj = workload("services", "root:org:app", "default", name);
        let key = layout().target_key;
        obj.metadata.labels.insert(intent_label(&key), "Sync".into());
        obj.metadata.labels.insert("tier".into(), "web".into());
        obj.metadata.finalizers.push("workload.kplane.dev/syncer-x".into());
        obj.metadata.resource_version = 7;
        obj
    }

    fn services() -> std::sync::Arc<dyn Syncable> {
        let mut registry = KindRegistry::new();
        registry.activate("services");
        registry.get("services").unwrap()
    }

    #[test]
    fn test_mirror_carries_provenance_but_no_intent() {
        let layout = layout();
        let upstream = placed("first");
        let mirror = layout.desired_mirror(&upstream, services().as_ref(), None);

        assert_eq!(mirror.metadata.name, "first");
        assert_eq!(mirror.metadata.workspace, "root:org:cluster-a");
        assert!(mirror.metadata.namespace.starts_with("kplane-"));
        assert_eq!(
            mirror.metadata.labels.get(CLUSTER_LABEL),
            Some(&layout.target_key.to_string())
        );
        assert_eq!(mirror.metadata.labels.get("tier").map(String::as_str), Some("web"));
        assert!(!mirror.metadata.labels.keys().any(|k| intent::is_intent_label(k)));
        assert!(mirror.metadata.finalizers.is_empty());
        assert_eq!(mirror.metadata.resource_version, 0);
        assert!(layout.owns(&mirror));
        assert_eq!(upstream_key_of(&mirror), Some(upstream.key()));
    }

    #[test]
    fn test_no_target_stuck_flag_reaches_the_mirror() {
        let layout = layout();
        let mut upstream = placed("first");
        let other = TargetKey::derive("root:org", "cluster-b");
        for key in [&layout.target_key, &other] {
            upstream
                .metadata
                .annotations
                .insert(deletion_stuck_annotation(key), "3 failed deletion attempts".into());
        }
        upstream
            .metadata
            .annotations
            .insert("team".into(), "payments".into());

        let mirror = layout.desired_mirror(&upstream, services().as_ref(), None);
        assert!(!mirror
            .metadata
            .annotations
            .keys()
            .any(|k| is_deletion_stuck_annotation(k)));
        assert_eq!(
            mirror.metadata.annotations.get("team").map(String::as_str),
            Some("payments")
        );
    }

    #[test]
    fn test_mirror_key_matches_desired_mirror() {
        let layout = layout();
        let upstream = placed("first");
        let mirror = layout.desired_mirror(&upstream, services().as_ref(), None);
        let key = layout.mirror_key(&upstream.key());

        assert_eq!(key.namespace, mirror.metadata.namespace);
        assert_eq!(key.workspace, mirror.metadata.workspace);
    }

    #[test]
    fn test_reapplying_the_same_state_changes_nothing() {
        let layout = layout();
        let upstream = placed("first");
        let syncable = services();

        let mut existing = layout.desired_mirror(&upstream, syncable.as_ref(), None);
        existing.metadata.resource_version = 3;
        existing.spec["clusterIP"] = json!("10.0.0.9");
        existing.status = Some(json!({"loadBalancer": {}}));

        let again = layout.desired_mirror(&upstream, syncable.as_ref(), Some(&existing));
        assert!(!needs_update(&existing, &again));
        assert_eq!(again.metadata.resource_version, 3);
        assert_eq!(again.status, existing.status);

        let mut changed = upstream.clone();
        changed.spec = json!({"ports": [{"port": 8080}]});
        let next = layout.desired_mirror(&changed, syncable.as_ref(), Some(&existing));
        assert!(needs_update(&existing, &next));
        assert_eq!(next.spec["clusterIP"], json!("10.0.0.9"));
    }

    #[test]
    fn test_workspaces_never_share_downstream_namespaces() {
        let layout = layout();
        let mut a = placed("first");
        let mut b = placed("first");
        a.metadata.workspace = "root:org:a".into();
        b.metadata.workspace = "root:org:b".into();

        let key_a = layout.mirror_key(&a.key());
        let key_b = layout.mirror_key(&b.key());
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn test_namespace_object_records_locator() {
        let layout = layout();
        let ns = layout.namespace_object("root:org:app", "default");
        let locator = NamespaceLocator::from_annotation(
            ns.metadata.annotations.get(NAMESPACE_LOCATOR_ANNOTATION).unwrap(),
        )
        .unwrap();
        assert_eq!(locator.workspace, "root:org:app");
        assert_eq!(locator.namespace, "default");
        assert_eq!(ns.metadata.name, layout.namespace_for("root:org:app", "default"));
    }
}
