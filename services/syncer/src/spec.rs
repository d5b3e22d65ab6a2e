//! Upstream to downstream reconcile.
//!
//! Keyed by the upstream object. Each pass reads the object's intent for
//! this target and drives the mirror towards it:
//!
//! - `Sync`: hold the syncer finalizer upstream, ensure the downstream
//!   namespace, then create or update the mirror (compare-and-swap)
//! - `Sync` on an object being deleted: release it to `Removing` first
//! - `Removing`: delete the mirror; only once it is confirmed absent, clear
//!   the intent and the finalizer in one write
//! - no intent, or no upstream object: make sure no mirror is left behind
//!
//! Only mirroring needs the kind to be active. Removal and cleanup work for
//! any kind, so a restart or a dropped kind never strands a `Removing`
//! intent.

use std::sync::Arc;
use std::time::Duration;

use kplane_api::intent::{self, IntentState, IntentTransition};
use kplane_api::labels::{deletion_stuck_annotation, syncer_finalizer};
use kplane_api::{KindRegistry, Object, Syncable};
use kplane_reconcile::{
    retry_on_conflict, BackoffPolicy, Outcome, RetryTracker, RetryableError, CONFLICT_ATTEMPTS,
};
use kplane_store::{ObjectKey, Resource, Store};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::SyncError;
use crate::mirror::{needs_update, MirrorLayout};

/// Failures are counted within this window when deciding whether a deletion
/// is stuck.
const DELETION_FAILURE_WINDOW: Duration = Duration::from_secs(3600);

/// How soon a placed object of a not yet active kind is looked at again.
const INACTIVE_KIND_RECHECK: Duration = Duration::from_secs(5);

pub struct SpecReconciler {
    layout: MirrorLayout,
    upstream: Arc<dyn Store<Object>>,
    downstream: Arc<dyn Store<Object>>,
    kinds: Arc<RwLock<KindRegistry>>,
    /// Failed deletions before the upstream object is flagged.
    stuck_after: u32,
    deletions: Mutex<RetryTracker>,
    removal_backoff: BackoffPolicy,
}

impl SpecReconciler {
    pub fn new(
        layout: MirrorLayout,
        upstream: Arc<dyn Store<Object>>,
        downstream: Arc<dyn Store<Object>>,
        kinds: Arc<RwLock<KindRegistry>>,
        stuck_after: u32,
    ) -> Self {
        Self {
            layout,
            upstream,
            downstream,
            kinds,
            stuck_after: stuck_after.max(1),
            deletions: Mutex::new(RetryTracker::new(stuck_after, DELETION_FAILURE_WINDOW)),
            removal_backoff: BackoffPolicy {
                base: Duration::from_millis(200),
                max: Duration::from_secs(30),
                jitter: 0.25,
            },
        }
    }

    #[instrument(skip(self), fields(target_key = %self.layout.target_key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, SyncError> {
        let mirror_key = self.layout.mirror_key(key);

        let Some(obj) = self.upstream.get(key).await? else {
            if self.delete_mirror(&mirror_key).await? {
                info!(%key, "Removed mirror of deleted upstream object");
            }
            return Ok(Outcome::Done);
        };

        let target_key = &self.layout.target_key;
        match intent::read(&obj.metadata, target_key) {
            IntentState::Absent => {
                if !self.delete_and_confirm(&mirror_key).await? {
                    debug!(%key, "Mirror still present, keeping finalizer");
                    return Ok(Outcome::RequeueAfter(self.removal_backoff.delay(0)));
                }
                let finalizer = syncer_finalizer(target_key);
                if obj.metadata.has_finalizer(&finalizer) {
                    self.mutate_upstream(key, |o| Ok(o.metadata.remove_finalizer(&finalizer)))
                        .await?;
                }
                Ok(Outcome::Done)
            }
            IntentState::Sync if obj.metadata.is_terminating() => {
                self.mutate_upstream(key, |o| {
                    intent::transition(&mut o.metadata, target_key, IntentTransition::Release)
                        .map_err(SyncError::from)
                })
                .await?;
                info!(%key, "Upstream object deleted, removing mirror");
                self.remove(key, &mirror_key).await
            }
            IntentState::Sync => {
                let syncable = self.kinds.read().await.get(&obj.kind);
                match syncable {
                    Some(syncable) => self.sync(&obj, syncable.as_ref()).await,
                    None => {
                        debug!(kind = %obj.kind, "Kind not syncable yet");
                        Ok(Outcome::RequeueAfter(INACTIVE_KIND_RECHECK))
                    }
                }
            }
            IntentState::Removing => self.remove(key, &mirror_key).await,
        }
    }

    async fn sync(&self, obj: &Object, syncable: &dyn Syncable) -> Result<Outcome, SyncError> {
        let key = obj.key();
        let target_key = &self.layout.target_key;

        let finalizer = syncer_finalizer(target_key);
        if !obj.metadata.has_finalizer(&finalizer) {
            self.mutate_upstream(&key, |o| {
                let placed = intent::read(&o.metadata, target_key) == IntentState::Sync;
                Ok(placed && o.metadata.add_finalizer(&finalizer))
            })
            .await?;
        }

        if !obj.metadata.namespace.is_empty() {
            self.ensure_namespace(&obj.metadata.workspace, &obj.metadata.namespace)
                .await?;
        }

        let mirror_key = self.layout.mirror_key(&key);
        let mirror_key = &mirror_key;
        let written = retry_on_conflict::<_, SyncError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                let existing = self.downstream.get(mirror_key).await?;
                let desired = self.layout.desired_mirror(obj, syncable, existing.as_ref());
                match existing {
                    Some(existing) if !needs_update(&existing, &desired) => Ok(false),
                    Some(_) => {
                        self.downstream.update(desired).await?;
                        Ok(true)
                    }
                    None => {
                        self.downstream.create(desired).await?;
                        Ok(true)
                    }
                }
            },
        )
        .await?;

        if written {
            info!(%key, mirror = %mirror_key, "Mirror written");
        }
        Ok(Outcome::Done)
    }

    async fn remove(&self, key: &ObjectKey, mirror_key: &ObjectKey) -> Result<Outcome, SyncError> {
        let tracker_key = key.to_string();
        let gone = match self.delete_and_confirm(mirror_key).await {
            Ok(gone) => gone,
            Err(e) if e.is_transient() => {
                return self.deletion_failed(key, &tracker_key, e.to_string()).await;
            }
            Err(e) => return Err(e),
        };
        if !gone {
            return self
                .deletion_failed(key, &tracker_key, "mirror still present".to_string())
                .await;
        }

        let target_key = &self.layout.target_key;
        let finalizer = syncer_finalizer(target_key);
        let stuck = deletion_stuck_annotation(target_key);
        self.mutate_upstream(key, |o| {
            let mut changed =
                intent::transition(&mut o.metadata, target_key, IntentTransition::Confirm)?;
            changed |= o.metadata.remove_finalizer(&finalizer);
            changed |= o.metadata.annotations.remove(&stuck).is_some();
            Ok(changed)
        })
        .await?;

        self.deletions.lock().await.clear(&tracker_key);
        info!(%key, "Mirror confirmed absent, intent cleared");
        Ok(Outcome::Done)
    }

    /// Delete the mirror and check it is really gone. A mirror held by
    /// downstream finalizers is still present.
    async fn delete_and_confirm(&self, mirror_key: &ObjectKey) -> Result<bool, SyncError> {
        self.delete_mirror(mirror_key).await?;
        Ok(self.downstream.get(mirror_key).await?.is_none())
    }

    /// Returns whether there was anything to delete.
    async fn delete_mirror(&self, mirror_key: &ObjectKey) -> Result<bool, SyncError> {
        match self.downstream.delete(mirror_key).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Count a failed removal, flag the upstream object once removal looks
    /// stuck, and look again after a growing delay.
    async fn deletion_failed(
        &self,
        key: &ObjectKey,
        tracker_key: &str,
        reason: String,
    ) -> Result<Outcome, SyncError> {
        let failures = self.deletions.lock().await.record_failure(tracker_key);
        warn!(%key, failures, %reason, "Downstream deletion not confirmed");

        if failures >= self.stuck_after {
            let annotation = deletion_stuck_annotation(&self.layout.target_key);
            let message = format!("{failures} failed deletion attempts, last: {reason}");
            let flagged = self
                .mutate_upstream(key, |o| {
                    if o.metadata.annotations.contains_key(&annotation) {
                        return Ok(false);
                    }
                    o.metadata
                        .annotations
                        .insert(annotation.clone(), message.clone());
                    Ok(true)
                })
                .await?;
            if flagged {
                warn!(%key, failures, "Deletion stuck, flagged upstream");
            }
        }

        Ok(Outcome::RequeueAfter(
            self.removal_backoff.delay(failures.saturating_sub(1)),
        ))
    }

    async fn ensure_namespace(&self, workspace: &str, namespace: &str) -> Result<(), SyncError> {
        let ns = self.layout.namespace_object(workspace, namespace);
        let key = ns.key();
        if self.downstream.get(&key).await?.is_some() {
            return Ok(());
        }
        match self.downstream.create(ns).await {
            Ok(_) => info!(namespace = %key.name, %workspace, upstream_namespace = %namespace, "Created downstream namespace"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Read-modify-write an upstream object; `mutate` returns whether it
    /// changed anything. Returns whether a write happened.
    async fn mutate_upstream<F>(&self, key: &ObjectKey, mutate: F) -> Result<bool, SyncError>
    where
        F: Fn(&mut Object) -> Result<bool, SyncError> + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict::<_, SyncError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                let Some(mut obj) = self.upstream.get(key).await? else {
                    return Ok(false);
                };
                if !mutate(&mut obj)? {
                    return Ok(false);
                }
                self.upstream.update(obj).await?;
                Ok(true)
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kplane_api::kinds::NAMESPACES;
    use kplane_api::labels::{intent_label, CLUSTER_LABEL};
    use kplane_id::TargetKey;
    use kplane_store::{ListQuery, MemoryStore};
    use kplane_testing::{workload, FaultyStore};
    use serde_json::json;

    struct Fixture {
        upstream: Arc<MemoryStore<Object>>,
        downstream: Arc<FaultyStore<Object>>,
        reconciler: SpecReconciler,
        key: TargetKey,
    }

    fn fixture(stuck_after: u32) -> Fixture {
        let key = TargetKey::derive("root:org", "cluster-a");
        let upstream = Arc::new(MemoryStore::new());
        let downstream = Arc::new(FaultyStore::<Object>::new(Arc::new(MemoryStore::<Object>::new())));
        let reconciler = SpecReconciler::new(
            MirrorLayout::new(key.clone(), "root:org:cluster-a"),
            upstream.clone(),
            downstream.clone(),
            Arc::new(RwLock::new(KindRegistry::new())),
            stuck_after,
        );
        Fixture {
            upstream,
            downstream,
            reconciler,
            key,
        }
    }

    impl Fixture {
        async fn place(&self, name: &str) -> Object {
            let mut obj = workload("configmaps", "root:org:app", "default", name);
            obj.spec = json!({"data": {"mode": "fast"}});
            obj.metadata
                .labels
                .insert(intent_label(&self.key), intent::SYNC.into());
            self.upstream.create(obj).await.unwrap()
        }

        async fn upstream_obj(&self, name: &str) -> Option<Object> {
            let key = ObjectKey::new("configmaps", "root:org:app", "default", name);
            self.upstream.get(&key).await.unwrap()
        }

        async fn mirrors(&self) -> Vec<Object> {
            self.downstream
                .list(&ListQuery::all().kind("configmaps"))
                .await
                .unwrap()
        }

        async fn set_intent(&self, name: &str, transition: IntentTransition) {
            let mut obj = self.upstream_obj(name).await.unwrap();
            intent::transition(&mut obj.metadata, &self.key, transition).unwrap();
            self.upstream.update(obj).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sync_creates_namespace_and_mirror() {
        let f = fixture(3);
        let obj = f.place("settings").await;

        let outcome = f.reconciler.reconcile(&obj.key()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        let mirrors = f.mirrors().await;
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].spec, obj.spec);
        assert_eq!(
            mirrors[0].metadata.labels.get(CLUSTER_LABEL),
            Some(&f.key.to_string())
        );

        let namespaces = f
            .downstream
            .list(&ListQuery::all().kind(NAMESPACES))
            .await
            .unwrap();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].metadata.name, mirrors[0].metadata.namespace);

        let upstream = f.upstream_obj("settings").await.unwrap();
        assert!(upstream
            .metadata
            .has_finalizer(&syncer_finalizer(&f.key)));
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let f = fixture(3);
        let obj = f.place("settings").await;
        f.reconciler.reconcile(&obj.key()).await.unwrap();
        let first = f.mirrors().await;

        f.reconciler.reconcile(&obj.key()).await.unwrap();
        let second = f.mirrors().await;
        assert_eq!(first, second);
        assert_eq!(
            first[0].metadata.resource_version,
            second[0].metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_spec_change_updates_mirror() {
        let f = fixture(3);
        let obj = f.place("settings").await;
        f.reconciler.reconcile(&obj.key()).await.unwrap();

        let mut current = f.upstream_obj("settings").await.unwrap();
        current.spec = json!({"data": {"mode": "slow"}});
        f.upstream.update(current).await.unwrap();
        f.reconciler.reconcile(&obj.key()).await.unwrap();

        assert_eq!(f.mirrors().await[0].spec, json!({"data": {"mode": "slow"}}));
    }

    #[tokio::test]
    async fn test_removal_deletes_mirror_before_clearing_intent() {
        let f = fixture(3);
        let obj = f.place("settings").await;
        f.reconciler.reconcile(&obj.key()).await.unwrap();
        f.set_intent("settings", IntentTransition::Release).await;

        f.reconciler.reconcile(&obj.key()).await.unwrap();

        assert!(f.mirrors().await.is_empty());
        let upstream = f.upstream_obj("settings").await.unwrap();
        assert_eq!(intent::read(&upstream.metadata, &f.key), IntentState::Absent);
        assert!(!upstream.metadata.has_finalizer(&syncer_finalizer(&f.key)));
    }

    #[tokio::test]
    async fn test_upstream_delete_goes_through_removal() {
        let f = fixture(3);
        let obj = f.place("settings").await;
        f.reconciler.reconcile(&obj.key()).await.unwrap();

        // The finalizer keeps the object around as terminating.
        f.upstream.delete(&obj.key()).await.unwrap();
        assert!(f.upstream_obj("settings").await.unwrap().metadata.is_terminating());

        f.reconciler.reconcile(&obj.key()).await.unwrap();
        assert!(f.mirrors().await.is_empty());
        assert!(f.upstream_obj("settings").await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_target_flags_stuck_deletion() {
        let f = fixture(2);
        let obj = f.place("settings").await;
        f.reconciler.reconcile(&obj.key()).await.unwrap();
        f.set_intent("settings", IntentTransition::Release).await;
        f.downstream.set_unreachable(true);

        let stuck = deletion_stuck_annotation(&f.key);
        for attempt in 1..=3 {
            let outcome = f.reconciler.reconcile(&obj.key()).await.unwrap();
            assert!(matches!(outcome, Outcome::RequeueAfter(_)));

            let upstream = f.upstream_obj("settings").await.unwrap();
            assert_eq!(intent::read(&upstream.metadata, &f.key), IntentState::Removing);
            assert_eq!(upstream.metadata.annotations.contains_key(&stuck), attempt >= 2);
        }

        f.downstream.set_unreachable(false);
        f.reconciler.reconcile(&obj.key()).await.unwrap();
        let upstream = f.upstream_obj("settings").await.unwrap();
        assert_eq!(intent::read(&upstream.metadata, &f.key), IntentState::Absent);
        assert!(!upstream.metadata.annotations.contains_key(&stuck));
        assert!(f.mirrors().await.is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_mirror_is_removed() {
        let f = fixture(3);
        let obj = f.place("settings").await;
        f.reconciler.reconcile(&obj.key()).await.unwrap();

        // Gone upstream without passing through removal.
        let mut current = f.upstream_obj("settings").await.unwrap();
        current.metadata.finalizers.clear();
        f.upstream.update(current).await.unwrap();
        f.upstream.delete(&obj.key()).await.unwrap();

        f.reconciler.reconcile(&obj.key()).await.unwrap();
        assert!(f.mirrors().await.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_kind_is_ignored() {
        let f = fixture(3);
        let mut obj = workload("widgets", "root:org:app", "default", "w");
        obj.metadata
            .labels
            .insert(intent_label(&f.key), intent::SYNC.into());
        let obj = f.upstream.create(obj).await.unwrap();

        assert_eq!(
            f.reconciler.reconcile(&obj.key()).await.unwrap(),
            Outcome::RequeueAfter(INACTIVE_KIND_RECHECK)
        );
        let all = f.downstream.list(&ListQuery::all()).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_removal_of_inactive_kind_is_confirmed() {
        let f = fixture(3);
        let layout = MirrorLayout::new(f.key.clone(), "root:org:cluster-a");

        // Mirrored by an earlier run that had the kind active.
        let mut obj = workload("widgets", "root:org:app", "default", "w");
        obj.metadata
            .labels
            .insert(intent_label(&f.key), intent::REMOVING.into());
        obj.metadata.add_finalizer(&syncer_finalizer(&f.key));
        let obj = f.upstream.create(obj).await.unwrap();
        let mut active = KindRegistry::new();
        active.activate("widgets");
        let syncable = active.get("widgets").unwrap();
        f.downstream
            .create(layout.desired_mirror(&obj, syncable.as_ref(), None))
            .await
            .unwrap();

        let outcome = f.reconciler.reconcile(&obj.key()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        let mirror = f.downstream.get(&layout.mirror_key(&obj.key())).await.unwrap();
        assert!(mirror.is_none());
        let upstream = f.upstream.get(&obj.key()).await.unwrap().unwrap();
        assert_eq!(intent::read(&upstream.metadata, &f.key), IntentState::Absent);
        assert!(!upstream.metadata.has_finalizer(&syncer_finalizer(&f.key)));
    }

    #[tokio::test]
    async fn test_finalizer_stays_until_mirror_is_gone() {
        let f = fixture(3);
        let obj = f.place("settings").await;
        f.reconciler.reconcile(&obj.key()).await.unwrap();

        // Intent dropped without going through removal.
        let mut current = f.upstream_obj("settings").await.unwrap();
        current.metadata.labels.remove(&intent_label(&f.key));
        f.upstream.update(current).await.unwrap();

        f.downstream.set_unreachable(true);
        assert!(f.reconciler.reconcile(&obj.key()).await.is_err());
        let upstream = f.upstream_obj("settings").await.unwrap();
        assert!(upstream.metadata.has_finalizer(&syncer_finalizer(&f.key)));

        f.downstream.set_unreachable(false);
        assert_eq!(f.reconciler.reconcile(&obj.key()).await.unwrap(), Outcome::Done);
        assert!(f.mirrors().await.is_empty());
        let upstream = f.upstream_obj("settings").await.unwrap();
        assert!(!upstream.metadata.has_finalizer(&syncer_finalizer(&f.key)));
    }
}
