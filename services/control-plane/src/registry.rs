//! Target registry.
//!
//! Tracks registered execution targets and their readiness. Readiness is
//! only ever set explicitly: by the target's own heartbeat, or by the
//! liveness monitor through [`TargetRegistry::mark_not_ready`]. The registry
//! itself never infers anything from missing heartbeats.
//!
//! Every change lands in the targets store, whose watch stream is the
//! registry's change feed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kplane_api::conditions::{self, Condition, ConditionStatus};
use kplane_api::wire::{Heartbeat, Registration, TargetHandle};
use kplane_api::ExecutionTarget;
use kplane_id::{validate_dns_label, ObjectUid, WorkspaceName};
use kplane_reconcile::{retry_on_conflict, BackoffPolicy, RetryableError, CONFLICT_ATTEMPTS};
use kplane_store::{ListQuery, ObjectKey, Resource, Store, StoreError, WatchEvent};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("target not found: {0}")]
    NotFound(ObjectUid),

    #[error("invalid registration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RetryableError for RegistryError {
    fn is_transient(&self) -> bool {
        match self {
            RegistryError::NotFound(_) => true,
            RegistryError::Invalid(_) => false,
            RegistryError::Store(e) => e.is_transient(),
        }
    }

    fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Store(e) if e.is_conflict())
    }
}

fn handle_of(target: &ExecutionTarget) -> Result<TargetHandle, RegistryError> {
    let uid = target
        .metadata
        .uid
        .ok_or_else(|| RegistryError::Invalid("stored target without uid".to_string()))?;
    Ok(TargetHandle {
        uid,
        workspace: target.metadata.workspace.clone(),
        name: target.metadata.name.clone(),
        key: target.target_key(),
    })
}

pub struct TargetRegistry {
    targets: Arc<dyn Store<ExecutionTarget>>,
    /// Where each known UID is stored. Filled on registration and on lookup.
    keys: RwLock<HashMap<ObjectUid, ObjectKey>>,
}

impl TargetRegistry {
    pub fn new(targets: Arc<dyn Store<ExecutionTarget>>) -> Self {
        Self {
            targets,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Register a target, or refresh the declared facts of one that is
    /// already registered under the same name. Re-registration keeps the
    /// UID and the readiness condition.
    #[instrument(skip(self, registration), fields(workspace = %registration.workspace, name = %registration.name))]
    pub async fn register(&self, registration: Registration) -> Result<TargetHandle, RegistryError> {
        WorkspaceName::parse(&registration.workspace)
            .map_err(|e| RegistryError::Invalid(e.to_string()))?;
        validate_dns_label(&registration.name).map_err(RegistryError::Invalid)?;

        let key = ObjectKey::cluster_scoped(
            kplane_api::kinds::EXECUTION_TARGETS,
            &registration.workspace,
            &registration.name,
        );

        let registration = &registration;
        let key = &key;
        let target = retry_on_conflict::<_, RegistryError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                match self.targets.get(key).await? {
                    Some(mut existing) => {
                        if existing.spec.supported_kinds == registration.supported_kinds
                            && existing.metadata.labels == registration.labels
                        {
                            return Ok(existing);
                        }
                        existing.spec.supported_kinds = registration.supported_kinds.clone();
                        existing.metadata.labels = registration.labels.clone();
                        Ok(self.targets.update(existing).await?)
                    }
                    None => {
                        let mut target = ExecutionTarget::new(
                            &registration.workspace,
                            &registration.name,
                            registration.supported_kinds.clone(),
                        );
                        target.metadata.labels = registration.labels.clone();
                        conditions::set(
                            &mut target.status.conditions,
                            Condition::new(conditions::READY, ConditionStatus::Unknown)
                                .with_reason("Registered")
                                .with_message("waiting for the first heartbeat"),
                        );
                        Ok(self.targets.create(target).await?)
                    }
                }
            },
        )
        .await?;

        let handle = handle_of(&target)?;
        self.keys.write().await.insert(handle.uid, key.clone());
        info!(uid = %handle.uid, target_key = %handle.key, "Target registered");
        Ok(handle)
    }

    /// Record a readiness report from the target itself.
    #[instrument(skip(self, heartbeat), fields(ready = heartbeat.ready))]
    pub async fn heartbeat(
        &self,
        uid: &ObjectUid,
        heartbeat: Heartbeat,
    ) -> Result<ExecutionTarget, RegistryError> {
        let heartbeat = &heartbeat;
        retry_on_conflict::<_, RegistryError, _, _>(&BackoffPolicy::conflict(), CONFLICT_ATTEMPTS, || async move {
            let mut target = self.get(uid).await?;
            let (status, reason) = if heartbeat.ready {
                (ConditionStatus::True, "HeartbeatReceived")
            } else {
                (ConditionStatus::False, "TargetReportedNotReady")
            };
            conditions::set(
                &mut target.status.conditions,
                Condition::new(conditions::READY, status)
                    .with_reason(reason)
                    .with_message(heartbeat.message.clone()),
            );
            target.status.last_heartbeat = Some(Utc::now());
            Ok(self.targets.update_status(target).await?)
        })
        .await
    }

    /// Flip a target to `NotReady` because its heartbeat went stale.
    ///
    /// `observed_heartbeat` is the heartbeat time the caller judged stale; if
    /// a newer heartbeat arrived in the meantime nothing changes. Returns
    /// whether the target was flipped.
    #[instrument(skip(self))]
    pub async fn mark_not_ready(
        &self,
        uid: &ObjectUid,
        observed_heartbeat: Option<DateTime<Utc>>,
        message: &str,
    ) -> Result<bool, RegistryError> {
        retry_on_conflict::<_, RegistryError, _, _>(&BackoffPolicy::conflict(), CONFLICT_ATTEMPTS, || async move {
            let mut target = self.get(uid).await?;
            if !target.is_ready() || target.status.last_heartbeat != observed_heartbeat {
                return Ok(false);
            }
            conditions::set(
                &mut target.status.conditions,
                Condition::new(conditions::READY, ConditionStatus::False)
                    .with_reason("HeartbeatTimeout")
                    .with_message(message),
            );
            self.targets.update_status(target).await?;
            warn!(%uid, "Target marked not ready");
            Ok::<_, RegistryError>(true)
        })
        .await
    }

    /// Remove a target.
    #[instrument(skip(self))]
    pub async fn deregister(&self, uid: &ObjectUid) -> Result<(), RegistryError> {
        let target = self.get(uid).await?;
        match self.targets.delete(&target.key()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.keys.write().await.remove(uid);
        info!(target_key = %target.target_key(), "Target deregistered");
        Ok(())
    }

    pub async fn get(&self, uid: &ObjectUid) -> Result<ExecutionTarget, RegistryError> {
        let known = self.keys.read().await.get(uid).cloned();
        if let Some(key) = known {
            match self.targets.get(&key).await? {
                Some(target) if target.metadata.uid.as_ref() == Some(uid) => return Ok(target),
                // Deleted, or replaced under the same name.
                _ => {
                    self.keys.write().await.remove(uid);
                }
            }
        }

        // Stored before this registry saw it: scan once, then remember it.
        debug!(%uid, "Target UID not indexed, scanning");
        let target = self
            .targets
            .list(&ListQuery::all())
            .await?
            .into_iter()
            .find(|t| t.metadata.uid.as_ref() == Some(uid))
            .ok_or(RegistryError::NotFound(*uid))?;
        self.keys.write().await.insert(*uid, target.key());
        Ok(target)
    }

    pub async fn list(&self, workspace: Option<&str>) -> Result<Vec<ExecutionTarget>, RegistryError> {
        let query = match workspace {
            Some(ws) => ListQuery::all().workspace(ws),
            None => ListQuery::all(),
        };
        Ok(self.targets.list(&query).await?)
    }

    /// Change feed: one event per registry mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent<ExecutionTarget>> {
        self.targets.watch()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use kplane_id::TargetKey;
    use kplane_store::MemoryStore;

    fn registry() -> TargetRegistry {
        TargetRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn registration(name: &str) -> Registration {
        Registration {
            workspace: "root:org".into(),
            name: name.into(),
            supported_kinds: vec!["services".into()],
            labels: BTreeMap::from([("region".to_string(), "eu".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_register_then_heartbeat() {
        let registry = registry();
        let handle = registry.register(registration("cluster-a")).await.unwrap();
        assert_eq!(handle.key, TargetKey::derive("root:org", "cluster-a"));

        let target = registry.get(&handle.uid).await.unwrap();
        assert!(!target.is_ready());

        let target = registry
            .heartbeat(&handle.uid, Heartbeat::ready())
            .await
            .unwrap();
        assert!(target.is_ready());
        assert!(target.status.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_lookup_by_uid_follows_the_store() {
        let targets = Arc::new(MemoryStore::new());
        let registry = TargetRegistry::new(targets.clone());

        // Written before this registry existed.
        let stored = targets
            .create(ExecutionTarget::new("root:org", "cluster-a", vec!["services".into()]))
            .await
            .unwrap();
        let uid = stored.metadata.uid.unwrap();
        assert_eq!(registry.get(&uid).await.unwrap().metadata.name, "cluster-a");

        // Replaced under the same name: the old UID is gone.
        targets.delete(&stored.key()).await.unwrap();
        let handle = registry.register(registration("cluster-a")).await.unwrap();
        assert_ne!(handle.uid, uid);
        assert!(matches!(
            registry.get(&uid).await.unwrap_err(),
            RegistryError::NotFound(_)
        ));
        assert_eq!(registry.get(&handle.uid).await.unwrap().metadata.uid, Some(handle.uid));
    }

    #[tokio::test]
    async fn test_reregistration_keeps_identity_and_readiness() {
        let registry = registry();
        let first = registry.register(registration("cluster-a")).await.unwrap();
        registry
            .heartbeat(&first.uid, Heartbeat::ready())
            .await
            .unwrap();

        let mut changed = registration("cluster-a");
        changed.supported_kinds.push("deployments".into());
        let second = registry.register(changed).await.unwrap();

        assert_eq!(first, second);
        let target = registry.get(&second.uid).await.unwrap();
        assert!(target.is_ready());
        assert!(target.supports("deployments"));
    }

    #[tokio::test]
    async fn test_register_rejects_bad_names() {
        let registry = registry();
        let err = registry.register(registration("Cluster_A")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Invalid(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_mark_not_ready_skips_fresh_heartbeats() {
        let registry = registry();
        let handle = registry.register(registration("cluster-a")).await.unwrap();
        let target = registry
            .heartbeat(&handle.uid, Heartbeat::ready())
            .await
            .unwrap();
        let observed = target.status.last_heartbeat;

        // A newer heartbeat lands before the monitor acts.
        registry
            .heartbeat(&handle.uid, Heartbeat::ready())
            .await
            .unwrap();
        assert!(!registry.mark_not_ready(&handle.uid, observed, "stale").await.unwrap());

        let current = registry.get(&handle.uid).await.unwrap().status.last_heartbeat;
        assert!(registry.mark_not_ready(&handle.uid, current, "stale").await.unwrap());
        assert!(!registry.get(&handle.uid).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_every_mutation_is_published() {
        let registry = registry();
        let mut events = registry.subscribe();

        let handle = registry.register(registration("cluster-a")).await.unwrap();
        registry
            .heartbeat(&handle.uid, Heartbeat::ready())
            .await
            .unwrap();
        registry.deregister(&handle.uid).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), WatchEvent::Added(_)));
        assert!(matches!(events.recv().await.unwrap(), WatchEvent::Modified(_)));
        assert!(events.recv().await.unwrap().is_deleted());
        assert!(matches!(
            registry.get(&handle.uid).await.unwrap_err(),
            RegistryError::NotFound(_)
        ));
    }
}
