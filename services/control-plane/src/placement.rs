//! Placement engine.
//!
//! Binds a workspace to a location and keeps the workspace's objects
//! labelled for the target the placement selected:
//!
//! 1. Choose a target: keep the current one while it stays eligible,
//!    otherwise the eligible target with the smallest UID
//! 2. Stamp every namespace in the workspace with the placement annotation
//! 3. Move each syncable object's intents: `Sync` for the selected target,
//!    `Removing` for any other target still at `Sync`
//! 4. Report the phase, and `DeletionStuck` when objects wait on removal
//!    from a target that is gone or not ready
//!
//! The engine never confirms a removal; only the target's syncer does that
//! once the mirror is gone.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use kplane_api::conditions::{self, Condition, ConditionStatus};
use kplane_api::intent::{self, IntentState, IntentTransition};
use kplane_api::kinds::{BINDINGS, EXPORTS, LOCATIONS, NAMESPACES, PLACEMENTS};
use kplane_api::labels::{deletion_stuck_annotation, intent_label, PLACEMENT_ANNOTATION};
use kplane_api::{
    Binding, ExecutionTarget, KindRegistry, Location, Object, Placement, PlacementDecision,
    PlacementPhase, SelectedTarget, PLACEMENT_NAME,
};
use kplane_id::{validate_dns_label, TargetKey, WorkspaceName};
use kplane_reconcile::{
    forward_events, resync_every, retry_on_conflict, run_workers, BackoffPolicy, Outcome,
    RetryableError, WorkQueue, WorkerConfig, CONFLICT_ATTEMPTS,
};
use kplane_store::{
    LabelSelector, ListQuery, ObjectKey, ObjectMeta, Resource, StoreError, WatchEvent,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::stores::Stores;

/// How often a placement with stuck deletions is looked at again.
const STUCK_RECHECK: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("invalid placement: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RetryableError for PlacementError {
    fn is_transient(&self) -> bool {
        match self {
            PlacementError::Invalid(_) => false,
            PlacementError::Store(e) => e.is_transient(),
        }
    }

    fn is_conflict(&self) -> bool {
        matches!(self, PlacementError::Store(e) if e.is_conflict())
    }
}

pub struct PlacementEngine {
    stores: Stores,
    queue: WorkQueue<String>,
}

impl PlacementEngine {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            queue: WorkQueue::new(BackoffPolicy::default()),
        }
    }

    /// Bind `workspace` to a location, replacing any previous binding.
    #[instrument(skip(self))]
    pub async fn bind(
        &self,
        workspace: &str,
        location_workspace: &str,
        location_name: &str,
    ) -> Result<Placement, PlacementError> {
        for ws in [workspace, location_workspace] {
            WorkspaceName::parse(ws).map_err(|e| PlacementError::Invalid(e.to_string()))?;
        }
        validate_dns_label(location_name).map_err(PlacementError::Invalid)?;

        let key = placement_key(workspace);
        let key = &key;
        let placement = retry_on_conflict::<_, PlacementError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                match self.stores.placements.get(key).await? {
                    Some(mut existing) => {
                        if existing.spec.location_workspace == location_workspace
                            && existing.spec.location_name == location_name
                        {
                            return Ok(existing);
                        }
                        info!(
                            from_workspace = %existing.spec.location_workspace,
                            from = %existing.spec.location_name,
                            "Superseding placement"
                        );
                        existing.spec.location_workspace = location_workspace.to_string();
                        existing.spec.location_name = location_name.to_string();
                        Ok(self.stores.placements.update(existing).await?)
                    }
                    None => Ok(self
                        .stores
                        .placements
                        .create(Placement::new(workspace, location_workspace, location_name))
                        .await?),
                }
            },
        )
        .await?;

        self.queue.add(workspace.to_string());
        Ok(placement)
    }

    /// Remove the workspace's placement. Its objects move to `Removing`.
    #[instrument(skip(self))]
    pub async fn unbind(&self, workspace: &str) -> Result<(), PlacementError> {
        match self.stores.placements.delete(&placement_key(workspace)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.queue.add(workspace.to_string());
        Ok(())
    }

    pub async fn get(&self, workspace: &str) -> Result<Option<Placement>, PlacementError> {
        Ok(self.stores.placements.get(&placement_key(workspace)).await?)
    }

    /// Move every object holding `Sync` for `key` to `Removing`.
    ///
    /// Called when the target leaves the registry. Returns the number of
    /// objects changed.
    #[instrument(skip(self), fields(target_key = %key))]
    pub async fn release_target(&self, key: &TargetKey) -> Result<usize, PlacementError> {
        let selector = LabelSelector::equals(intent_label(key), intent::SYNC);
        let objects = self
            .stores
            .objects
            .list(&ListQuery::all().selector(selector))
            .await?;

        let mut released = 0;
        for obj in objects {
            let changed = self
                .mutate_object(&obj.key(), |obj| {
                    intent::transition(&mut obj.metadata, key, IntentTransition::Release)
                        .unwrap_or(false)
                })
                .await?;
            if changed {
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "Released objects from departed target");
        }
        Ok(released)
    }

    /// Run the engine until shutdown.
    pub async fn run(
        self: Arc<Self>,
        config: WorkerConfig,
        resync_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        let mut handles = Vec::new();

        handles.push({
            let queue = self.queue.clone();
            let events = self.stores.placements.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("placement-engine", events, shutdown, |event| {
                    queue.add(event.object().metadata.workspace.clone());
                    std::future::ready(())
                })
                .await;
            })
        });

        handles.push({
            let queue = self.queue.clone();
            let events = self.stores.objects.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("placement-engine", events, shutdown, |event| {
                    queue.add(event.object().metadata.workspace.clone());
                    std::future::ready(())
                })
                .await;
            })
        });

        handles.push({
            let this = Arc::clone(&self);
            let events = self.stores.locations.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("placement-engine", events, shutdown, |event| {
                    let this = Arc::clone(&this);
                    async move {
                        let location = event.object();
                        this.enqueue_matching(|p| {
                            p.spec.location_workspace == location.metadata.workspace
                                && p.spec.location_name == location.metadata.name
                        })
                        .await;
                    }
                })
                .await;
            })
        });

        handles.push({
            let this = Arc::clone(&self);
            let events = self.stores.targets.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("placement-engine", events, shutdown, |event| {
                    let this = Arc::clone(&this);
                    async move { this.on_target_event(event).await }
                })
                .await;
            })
        });

        handles.push({
            let this = Arc::clone(&self);
            let events = self.stores.exports.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("placement-engine", events, shutdown, |event| {
                    let this = Arc::clone(&this);
                    async move {
                        let workspace = event.object().metadata.workspace.clone();
                        this.enqueue_matching(|p| p.spec.location_workspace == workspace)
                            .await;
                    }
                })
                .await;
            })
        });

        handles.push({
            let queue = self.queue.clone();
            let events = self.stores.bindings.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("placement-engine", events, shutdown, |event| {
                    queue.add(event.object().metadata.workspace.clone());
                    std::future::ready(())
                })
                .await;
            })
        });

        handles.push({
            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                resync_every(resync_interval, shutdown, || {
                    let this = Arc::clone(&this);
                    async move { this.enqueue_matching(|_| true).await }
                })
                .await;
            })
        });

        let this = Arc::clone(&self);
        run_workers(
            self.queue.clone(),
            config,
            move |workspace: String| {
                let this = Arc::clone(&this);
                async move { this.reconcile(&workspace).await }
            },
            shutdown,
        )
        .await;

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn on_target_event(&self, event: WatchEvent<ExecutionTarget>) {
        let target = event.object();
        if event.is_deleted() {
            if let Err(e) = self.release_target(&target.target_key()).await {
                warn!(error = %e, target = %target.metadata.name, "Failed to release target, resync will retry");
            }
        }
        let workspace = target.metadata.workspace.clone();
        self.enqueue_matching(|p| p.spec.location_workspace == workspace)
            .await;
    }

    async fn enqueue_matching<F>(&self, filter: F)
    where
        F: Fn(&Placement) -> bool,
    {
        match self.stores.placements.list(&ListQuery::all()).await {
            Ok(placements) => {
                for placement in placements.iter().filter(|p| filter(p)) {
                    self.queue.add(placement.metadata.workspace.clone());
                }
            }
            Err(e) => warn!(error = %e, "Failed to list placements"),
        }
    }

    /// Reconcile the placement of one workspace.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, workspace: &str) -> Result<Outcome, PlacementError> {
        let Some(placement) = self.stores.placements.get(&placement_key(workspace)).await? else {
            debug!("No placement, releasing workspace");
            self.apply_decision(workspace, None).await?;
            return Ok(Outcome::Done);
        };

        let location_key = ObjectKey::cluster_scoped(
            LOCATIONS,
            &placement.spec.location_workspace,
            &placement.spec.location_name,
        );
        let location = self.stores.locations.get(&location_key).await?;
        let targets = self.stores.targets.list(&ListQuery::all()).await?;

        let mut status = placement.status.clone();
        let current = status.selected_target.clone();
        let selected = match &location {
            None => {
                conditions::set(
                    &mut status.conditions,
                    Condition::new(conditions::LOCATION_RESOLVED, ConditionStatus::False)
                        .with_reason("LocationNotFound")
                        .with_message(format!("location {location_key} does not exist")),
                );
                None
            }
            Some(location) => match select_target(location, &targets, current.as_ref()) {
                Ok(selected) => {
                    conditions::set(
                        &mut status.conditions,
                        Condition::new(conditions::LOCATION_RESOLVED, ConditionStatus::True)
                            .with_reason("Resolved"),
                    );
                    selected
                }
                Err(message) => {
                    conditions::set(
                        &mut status.conditions,
                        Condition::new(conditions::LOCATION_RESOLVED, ConditionStatus::False)
                            .with_reason("InvalidSelector")
                            .with_message(message),
                    );
                    hold_current(&targets, current.as_ref())
                }
            },
        };

        if selected != current {
            info!(
                from = ?current.as_ref().map(|t| &t.name),
                to = ?selected.as_ref().map(|t| &t.name),
                "Placement target changed"
            );
        }

        status.phase = match (&selected, status.phase) {
            (Some(_), _) => PlacementPhase::Bound,
            (None, PlacementPhase::Pending) => PlacementPhase::Pending,
            (None, _) => PlacementPhase::Unbound,
        };
        status.selected_target = selected.clone();

        if selected.is_some() {
            self.ensure_bindings(workspace, &placement.spec.location_workspace)
                .await?;
        }

        let decision = selected.map(|target| PlacementDecision {
            location_workspace: placement.spec.location_workspace.clone(),
            location: placement.spec.location_name.clone(),
            target: target.name,
            target_key: target.key,
        });
        self.apply_decision(workspace, decision.as_ref()).await?;

        let objects = self
            .stores
            .objects
            .list(&ListQuery::all().workspace(workspace))
            .await?;
        let stuck = count_stuck_deletions(&objects, &targets);
        if stuck > 0 {
            conditions::set(
                &mut status.conditions,
                Condition::new(conditions::DELETION_STUCK, ConditionStatus::True)
                    .with_reason("TargetUnavailable")
                    .with_message(format!(
                        "{stuck} object(s) waiting for removal from a target that is gone or not ready"
                    )),
            );
        } else {
            conditions::remove(&mut status.conditions, conditions::DELETION_STUCK);
        }

        if status != placement.status {
            let status = &status;
            let key = placement.key();
            let key = &key;
            retry_on_conflict::<_, PlacementError, _, _>(
                &BackoffPolicy::conflict(),
                CONFLICT_ATTEMPTS,
                || async move {
                    if let Some(mut current) = self.stores.placements.get(key).await? {
                        current.status = status.clone();
                        self.stores.placements.update_status(current).await?;
                    }
                    Ok(())
                },
            )
            .await?;
            info!(phase = %status.phase, stuck, "Placement status updated");
        }

        if stuck > 0 {
            return Ok(Outcome::RequeueAfter(STUCK_RECHECK));
        }
        Ok(Outcome::Done)
    }

    /// Stamp namespaces and move object intents to match `decision`.
    async fn apply_decision(
        &self,
        workspace: &str,
        decision: Option<&PlacementDecision>,
    ) -> Result<(), PlacementError> {
        let kinds = self.syncable_kinds(workspace).await?;
        let objects = self
            .stores
            .objects
            .list(&ListQuery::all().workspace(workspace))
            .await?;
        let annotation = decision.map(PlacementDecision::to_annotation);
        let target = decision.map(|d| &d.target_key);

        for obj in objects {
            if obj.kind == NAMESPACES {
                if obj.metadata.annotations.get(PLACEMENT_ANNOTATION) != annotation.as_ref() {
                    let annotation = &annotation;
                    self.mutate_object(&obj.key(), |ns| stamp_namespace(ns, annotation.as_deref()))
                        .await?;
                }
                continue;
            }

            if !kinds.contains(&obj.kind) || plan_intents(&obj.metadata, target).is_empty() {
                continue;
            }
            let changed = self
                .mutate_object(&obj.key(), |obj| apply_intents(&mut obj.metadata, target))
                .await?;
            if changed {
                debug!(
                    kind = %obj.kind,
                    namespace = %obj.metadata.namespace,
                    name = %obj.metadata.name,
                    "Sync intents updated"
                );
            }
        }
        Ok(())
    }

    /// Kinds the engine labels in `workspace`: native workload kinds plus
    /// every bound kind.
    async fn syncable_kinds(&self, workspace: &str) -> Result<BTreeSet<String>, PlacementError> {
        let mut kinds: BTreeSet<String> = KindRegistry::new().kinds().map(String::from).collect();
        let bindings = self
            .stores
            .bindings
            .list(&ListQuery::all().kind(BINDINGS).workspace(workspace))
            .await?;
        kinds.extend(bindings.into_iter().map(|b| b.spec.kind));
        Ok(kinds)
    }

    /// Bind every kind exported in the location workspace into `workspace`.
    async fn ensure_bindings(
        &self,
        workspace: &str,
        location_workspace: &str,
    ) -> Result<(), PlacementError> {
        let exports = self
            .stores
            .exports
            .list(&ListQuery::all().kind(EXPORTS).workspace(location_workspace))
            .await?;
        for export in exports {
            let binding = Binding::new(workspace, &export);
            if self.stores.bindings.get(&binding.key()).await?.is_some() {
                continue;
            }
            match self.stores.bindings.create(binding).await {
                Ok(_) => info!(kind = %export.spec.kind, "Bound exported kind into workspace"),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read-modify-write an object; `mutate` returns whether it changed
    /// anything. Returns whether a write happened.
    async fn mutate_object<F>(&self, key: &ObjectKey, mutate: F) -> Result<bool, PlacementError>
    where
        F: Fn(&mut Object) -> bool + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict::<_, PlacementError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                let Some(mut obj) = self.stores.objects.get(key).await? else {
                    return Ok(false);
                };
                if !mutate(&mut obj) {
                    return Ok(false);
                }
                self.stores.objects.update(obj).await?;
                Ok(true)
            },
        )
        .await
    }
}

fn placement_key(workspace: &str) -> ObjectKey {
    ObjectKey::cluster_scoped(PLACEMENTS, workspace, PLACEMENT_NAME)
}

/// Choose the target for a placement. Pure.
///
/// Returns `Ok(None)` when the location has no available instance, and the
/// selector error when it cannot be evaluated.
pub fn select_target(
    location: &Location,
    targets: &[ExecutionTarget],
    current: Option<&SelectedTarget>,
) -> Result<Option<SelectedTarget>, String> {
    let selector = location.selector().map_err(|e| e.to_string())?;
    if location.available() == 0 {
        return Ok(None);
    }

    let eligible: Vec<&ExecutionTarget> = targets
        .iter()
        .filter(|t| {
            location
                .spec
                .admits(&location.metadata.workspace, &selector, t)
        })
        .collect();

    let kept = current.and_then(|current| {
        eligible
            .iter()
            .find(|t| t.metadata.uid.as_ref() == Some(&current.uid))
    });
    let chosen = kept.or_else(|| {
        eligible
            .iter()
            .filter(|t| t.metadata.uid.is_some())
            .min_by_key(|t| t.metadata.uid.map(|uid| uid.to_string()))
    });

    Ok(chosen.and_then(|t| selected(t)))
}

/// With an unusable selector the current target stays while it is ready.
fn hold_current(
    targets: &[ExecutionTarget],
    current: Option<&SelectedTarget>,
) -> Option<SelectedTarget> {
    let current = current?;
    targets
        .iter()
        .find(|t| t.metadata.uid.as_ref() == Some(&current.uid) && t.is_ready())
        .and_then(selected)
}

fn selected(target: &ExecutionTarget) -> Option<SelectedTarget> {
    Some(SelectedTarget {
        name: target.metadata.name.clone(),
        uid: target.metadata.uid?,
        key: target.target_key(),
    })
}

/// Intent transitions that bring `meta` in line with `target`.
///
/// `Removing` intents are left alone: they only leave through the syncer's
/// confirmation, and the selected target is assigned again afterwards.
pub fn plan_intents(
    meta: &ObjectMeta,
    target: Option<&TargetKey>,
) -> Vec<(TargetKey, IntentTransition)> {
    if meta.is_terminating() {
        return Vec::new();
    }
    let mut plan: Vec<(TargetKey, IntentTransition)> = intent::all(meta)
        .into_iter()
        .filter(|(key, state)| *state == IntentState::Sync && Some(key) != target)
        .map(|(key, _)| (key, IntentTransition::Release))
        .collect();
    if let Some(target) = target {
        if intent::read(meta, target) == IntentState::Absent {
            plan.push((target.clone(), IntentTransition::Assign));
        }
    }
    plan
}

fn apply_intents(meta: &mut ObjectMeta, target: Option<&TargetKey>) -> bool {
    let mut changed = false;
    for (key, transition) in plan_intents(meta, target) {
        changed |= intent::transition(meta, &key, transition).unwrap_or(false);
    }
    changed
}

fn stamp_namespace(ns: &mut Object, annotation: Option<&str>) -> bool {
    let annotations = &mut ns.metadata.annotations;
    match annotation {
        Some(value) if annotations.get(PLACEMENT_ANNOTATION).map(String::as_str) != Some(value) => {
            annotations.insert(PLACEMENT_ANNOTATION.to_string(), value.to_string());
            true
        }
        None => annotations.remove(PLACEMENT_ANNOTATION).is_some(),
        _ => false,
    }
}

/// Objects waiting on removal from a target that cannot confirm it: the
/// target is gone or not ready, or its syncer reported the deletion stuck.
pub fn count_stuck_deletions(objects: &[Object], targets: &[ExecutionTarget]) -> usize {
    let live: HashSet<TargetKey> = targets
        .iter()
        .filter(|t| t.is_ready())
        .map(ExecutionTarget::target_key)
        .collect();

    objects
        .iter()
        .filter(|obj| {
            intent::all(&obj.metadata).iter().any(|(key, state)| {
                *state == IntentState::Removing
                    && (!live.contains(key)
                        || obj
                            .metadata
                            .annotations
                            .contains_key(&deletion_stuck_annotation(key)))
            })
        })
        .count()
}
