//! Location resolver.
//!
//! Keeps `Location.status.availableInstances` equal to the number of ready
//! targets matching the location. A registry event re-enqueues every
//! location in the target's workspace; the reconcile recomputes membership
//! from scratch, so replaying or reordering events cannot skew the count.
//!
//! A malformed selector is reported through the `SelectorValid` condition
//! and leaves the last good count in place.

use std::sync::Arc;

use kplane_api::conditions::{self, Condition, ConditionStatus};
use kplane_api::{ExecutionTarget, Location, LocationStatus};
use kplane_reconcile::{
    forward_events, resync_every, retry_on_conflict, run_workers, BackoffPolicy, Outcome,
    RetryableError, WorkQueue, WorkerConfig, CONFLICT_ATTEMPTS,
};
use kplane_store::{ListQuery, ObjectKey, Resource, Store, StoreError, WatchEvent};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RetryableError for ResolverError {
    fn is_transient(&self) -> bool {
        match self {
            ResolverError::Store(e) => e.is_transient(),
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            ResolverError::Store(e) => e.is_conflict(),
        }
    }
}

pub struct LocationResolver {
    locations: Arc<dyn Store<Location>>,
    targets: Arc<dyn Store<ExecutionTarget>>,
    queue: WorkQueue<ObjectKey>,
}

impl LocationResolver {
    pub fn new(
        locations: Arc<dyn Store<Location>>,
        targets: Arc<dyn Store<ExecutionTarget>>,
    ) -> Self {
        Self {
            locations,
            targets,
            queue: WorkQueue::new(BackoffPolicy::default()),
        }
    }

    /// Run the resolver until shutdown.
    pub async fn run(
        self: Arc<Self>,
        config: WorkerConfig,
        resync_interval: std::time::Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        let targets = {
            let this = Arc::clone(&self);
            let events = self.targets.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("location-resolver", events, shutdown, |event| {
                    let this = Arc::clone(&this);
                    async move { this.on_target_event(&event).await }
                })
                .await;
            })
        };

        let locations = {
            let queue = self.queue.clone();
            let events = self.locations.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("location-resolver", events, shutdown, |event| {
                    if !event.is_deleted() {
                        queue.add(event.object().key());
                    }
                    std::future::ready(())
                })
                .await;
            })
        };

        let resync = {
            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                resync_every(resync_interval, shutdown, || {
                    let this = Arc::clone(&this);
                    async move { this.enqueue_all(None).await }
                })
                .await;
            })
        };

        let this = Arc::clone(&self);
        run_workers(
            self.queue.clone(),
            config,
            move |key: ObjectKey| {
                let this = Arc::clone(&this);
                async move { this.reconcile(&key).await }
            },
            shutdown,
        )
        .await;

        for handle in [targets, locations, resync] {
            let _ = handle.await;
        }
    }

    async fn on_target_event(&self, event: &WatchEvent<ExecutionTarget>) {
        let workspace = event.object().metadata.workspace.clone();
        self.enqueue_all(Some(&workspace)).await;
    }

    /// Enqueue every location, or every location in `workspace`.
    pub async fn enqueue_all(&self, workspace: Option<&str>) {
        let query = match workspace {
            Some(ws) => ListQuery::all().workspace(ws),
            None => ListQuery::all(),
        };
        match self.locations.list(&query).await {
            Ok(locations) => {
                for location in locations {
                    self.queue.add(location.key());
                }
            }
            Err(e) => warn!(error = %e, "Failed to list locations for resync"),
        }
    }

    /// Recompute one location's status.
    #[instrument(skip(self), fields(location = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, ResolverError> {
        let Some(location) = self.locations.get(key).await? else {
            debug!("Location gone");
            return Ok(Outcome::Done);
        };

        let targets = self
            .targets
            .list(&ListQuery::all().workspace(&location.metadata.workspace))
            .await?;
        let desired = compute_status(&location, &targets);
        if desired == location.status {
            return Ok(Outcome::Done);
        }

        let desired = &desired;
        let updated = retry_on_conflict::<_, ResolverError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                let Some(mut current) = self.locations.get(key).await? else {
                    return Ok(None);
                };
                current.status = desired.clone();
                Ok(Some(self.locations.update_status(current).await?))
            },
        )
        .await?;

        if let Some(updated) = updated {
            info!(
                available_instances = ?updated.status.available_instances,
                instances = ?updated.status.instances,
                "Location availability updated"
            );
        }
        Ok(Outcome::Done)
    }
}

/// Desired status of `location` given the current targets. Pure.
pub fn compute_status(location: &Location, targets: &[ExecutionTarget]) -> LocationStatus {
    let mut status = location.status.clone();

    let selector = match location.selector() {
        Ok(selector) => selector,
        Err(e) => {
            conditions::set(
                &mut status.conditions,
                Condition::new(conditions::SELECTOR_VALID, ConditionStatus::False)
                    .with_reason("InvalidSelector")
                    .with_message(e.to_string()),
            );
            return status;
        }
    };

    let mut instances: Vec<String> = targets
        .iter()
        .filter(|t| location.spec.admits(&location.metadata.workspace, &selector, t))
        .map(|t| t.metadata.name.clone())
        .collect();
    instances.sort();

    status.available_instances = Some(instances.len() as u32);
    status.instances = instances;
    conditions::set(
        &mut status.conditions,
        Condition::new(conditions::SELECTOR_VALID, ConditionStatus::True).with_reason("Parsed"),
    );
    status
}
