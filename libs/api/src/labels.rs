//! Label and annotation keys.

use kplane_id::TargetKey;

/// Prefix of sync-intent label keys: `state.workload.kplane.dev/<target-key>`.
pub const INTENT_LABEL_PREFIX: &str = "state.workload.kplane.dev/";

/// Provenance label on downstream mirrors, valued with the owning target key.
pub const CLUSTER_LABEL: &str = "internal.workload.kplane.dev/cluster";

pub const SOURCE_WORKSPACE_ANNOTATION: &str = "workload.kplane.dev/source-workspace";
pub const SOURCE_NAMESPACE_ANNOTATION: &str = "workload.kplane.dev/source-namespace";
pub const SOURCE_NAME_ANNOTATION: &str = "workload.kplane.dev/source-name";

/// Namespace annotation recording the placement decision.
pub const PLACEMENT_ANNOTATION: &str = "scheduling.kplane.dev/placement";

/// Downstream namespace annotation recording where its objects come from.
pub const NAMESPACE_LOCATOR_ANNOTATION: &str = "kplane.dev/namespace-locator";

const SYNCER_FINALIZER_PREFIX: &str = "workload.kplane.dev/syncer-";
const DELETION_STUCK_PREFIX: &str = "workload.kplane.dev/deletion-stuck-";

/// Label key holding the sync intent for `key`.
pub fn intent_label(key: &TargetKey) -> String {
    format!("{INTENT_LABEL_PREFIX}{key}")
}

/// Target key of an intent label key, if it is one.
pub fn target_of_intent_label(label: &str) -> Option<TargetKey> {
    label
        .strip_prefix(INTENT_LABEL_PREFIX)
        .and_then(|key| TargetKey::parse(key).ok())
}

/// Finalizer the syncer for `key` holds on upstream objects it mirrors.
pub fn syncer_finalizer(key: &TargetKey) -> String {
    format!("{SYNCER_FINALIZER_PREFIX}{key}")
}

/// Annotation the syncer for `key` sets when downstream deletion keeps failing.
pub fn deletion_stuck_annotation(key: &TargetKey) -> String {
    format!("{DELETION_STUCK_PREFIX}{key}")
}

/// Whether `annotation` is a deletion-stuck flag of any target.
pub fn is_deletion_stuck_annotation(annotation: &str) -> bool {
    annotation.starts_with(DELETION_STUCK_PREFIX)
}
