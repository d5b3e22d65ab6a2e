//! kplane sync agent.
//!
//! One syncer runs per execution target. It registers the target, keeps its
//! heartbeat going, makes the configured kinds syncable, and runs two
//! reconcilers:
//!
//! - spec: upstream objects holding an intent for this target are mirrored
//!   downstream, or their mirrors removed
//! - status: observed status on mirrors is copied back upstream
//!
//! Upstream and downstream are plain [`Store`]s; the binary wires them to
//! remote object APIs, the end-to-end suite to in-process stores.

pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod mirror;
pub mod remote;
pub mod schema;
pub mod spec;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use kplane_api::intent::{self, IntentState};
use kplane_api::labels::{intent_label, syncer_finalizer, CLUSTER_LABEL};
use kplane_api::wire::{Registration, TargetHandle};
use kplane_api::{KindRegistry, Object};
use kplane_id::TargetKey;
use kplane_reconcile::{
    forward_events, resync_every, run_workers, BackoffPolicy, RetryableError, WorkQueue,
    WorkerConfig,
};
use kplane_store::{LabelSelector, ListQuery, ObjectKey, Resource, Store, WatchEvent};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::ControlPlaneApi;
use crate::config::Config;
use crate::error::SyncError;
use crate::heartbeat::HeartbeatLoop;
use crate::mirror::{upstream_key_of, MirrorLayout};
use crate::schema::SchemaImporter;
use crate::spec::SpecReconciler;
use crate::status::StatusReconciler;

/// Registration attempts before a transient failure is returned.
const REGISTER_ATTEMPTS: u32 = 5;

/// The sync agent for one target.
pub struct Syncer {
    config: Config,
    control_plane: Arc<dyn ControlPlaneApi>,
    upstream: Arc<dyn Store<Object>>,
    downstream: Arc<dyn Store<Object>>,
}

/// A started syncer.
pub struct RunningSyncer {
    pub target: TargetHandle,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Syncer {
    pub fn new(
        config: Config,
        control_plane: Arc<dyn ControlPlaneApi>,
        upstream: Arc<dyn Store<Object>>,
        downstream: Arc<dyn Store<Object>>,
    ) -> Self {
        Self {
            config,
            control_plane,
            upstream,
            downstream,
        }
    }

    /// Key this syncer's target registers under.
    pub fn target_key(config: &Config) -> TargetKey {
        TargetKey::derive(&config.target_workspace, &config.target_name)
    }

    /// Register the target, retrying transient failures.
    pub async fn register(&self) -> Result<TargetHandle, SyncError> {
        let registration = Registration {
            workspace: self.config.target_workspace.clone(),
            name: self.config.target_name.clone(),
            supported_kinds: self.config.resources.clone(),
            labels: self.config.labels.clone(),
        };

        let backoff = BackoffPolicy::default();
        let mut attempt = 0;
        loop {
            match self.control_plane.register(&registration).await {
                Ok(handle) => {
                    info!(uid = %handle.uid, target_key = %handle.key, "Target registered");
                    return Ok(handle);
                }
                Err(e) if e.is_transient() && attempt + 1 < REGISTER_ATTEMPTS => {
                    warn!(error = %e, attempt, "Registration failed, retrying");
                    tokio::time::sleep(backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn worker_config(&self, name: &str) -> WorkerConfig {
        WorkerConfig {
            workers: self.config.workers,
            ..WorkerConfig::named(name)
        }
    }

    /// Register, then start every loop. They stop once `shutdown` flips to
    /// true.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<RunningSyncer, SyncError> {
        let target = self.register().await?;
        let layout = MirrorLayout::new(target.key.clone(), &self.config.downstream_workspace);
        let kinds = Arc::new(RwLock::new(KindRegistry::new()));

        let spec = Arc::new(SpecReconciler::new(
            layout.clone(),
            Arc::clone(&self.upstream),
            Arc::clone(&self.downstream),
            Arc::clone(&kinds),
            self.config.stuck_deletion_after,
        ));
        let status = Arc::new(StatusReconciler::new(
            layout.clone(),
            Arc::clone(&self.upstream),
            Arc::clone(&self.downstream),
            Arc::clone(&kinds),
        ));
        let feed = Feed {
            layout,
            upstream: Arc::clone(&self.upstream),
            downstream: Arc::clone(&self.downstream),
            spec_queue: WorkQueue::new(BackoffPolicy::default()),
            status_queue: WorkQueue::new(BackoffPolicy::default()),
        };

        let mut tasks = Vec::new();

        let heartbeat = HeartbeatLoop::new(
            Arc::clone(&self.control_plane),
            Arc::clone(&self.downstream),
            &self.config.downstream_workspace,
            target.uid,
            self.config.heartbeat_interval,
        );
        tasks.push({
            let shutdown = shutdown.clone();
            tokio::spawn(async move { heartbeat.run(shutdown).await })
        });

        let importer = SchemaImporter::new(
            Arc::clone(&self.control_plane),
            Arc::clone(&self.downstream),
            Arc::clone(&kinds),
            &self.config.target_workspace,
            &self.config.target_name,
            &self.config.downstream_workspace,
        );
        tasks.push({
            let resources = self.config.resources.clone();
            let poll = self.config.poll_interval;
            let feed = feed.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                importer
                    .run(&resources, poll, shutdown, |_kind| {
                        let feed = feed.clone();
                        tokio::spawn(async move { feed.resync().await });
                    })
                    .await;
            })
        });

        tasks.push({
            let feed = feed.clone();
            let events = self.upstream.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("syncer-upstream", events, shutdown, |event| {
                    feed.on_upstream(&event);
                    std::future::ready(())
                })
                .await;
            })
        });

        tasks.push({
            let feed = feed.clone();
            let events = self.downstream.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("syncer-downstream", events, shutdown, |event| {
                    feed.on_downstream(&event);
                    std::future::ready(())
                })
                .await;
            })
        });

        tasks.push({
            let feed = feed.clone();
            let shutdown = shutdown.clone();
            let interval = self.config.resync_interval;
            tokio::spawn(async move {
                resync_every(interval, shutdown, || {
                    let feed = feed.clone();
                    async move { feed.resync().await }
                })
                .await;
            })
        });

        tasks.push(tokio::spawn(run_workers(
            feed.spec_queue.clone(),
            self.worker_config("syncer-spec"),
            move |key: ObjectKey| {
                let spec = Arc::clone(&spec);
                async move { spec.reconcile(&key).await }
            },
            shutdown.clone(),
        )));

        tasks.push(tokio::spawn(run_workers(
            feed.status_queue.clone(),
            self.worker_config("syncer-status"),
            move |key: ObjectKey| {
                let status = Arc::clone(&status);
                async move { status.reconcile(&key).await }
            },
            shutdown,
        )));

        info!(
            target = %target.name,
            resources = ?self.config.resources,
            "Syncer started"
        );
        Ok(RunningSyncer { target, tasks })
    }
}

/// Turns store changes into work for both reconcilers.
#[derive(Clone)]
struct Feed {
    layout: MirrorLayout,
    upstream: Arc<dyn Store<Object>>,
    downstream: Arc<dyn Store<Object>>,
    spec_queue: WorkQueue<ObjectKey>,
    status_queue: WorkQueue<ObjectKey>,
}

impl Feed {
    fn enqueue(&self, key: ObjectKey) {
        self.status_queue.add(key.clone());
        self.spec_queue.add(key);
    }

    fn on_upstream(&self, event: &WatchEvent<Object>) {
        let obj = event.object();
        let target_key = &self.layout.target_key;
        let ours = intent::read(&obj.metadata, target_key) != IntentState::Absent
            || obj.metadata.has_finalizer(&syncer_finalizer(target_key));
        if ours {
            self.enqueue(obj.key());
        }
    }

    fn on_downstream(&self, event: &WatchEvent<Object>) {
        let mirror = event.object();
        if !self.layout.owns(mirror) {
            return;
        }
        if let Some(key) = upstream_key_of(mirror) {
            self.enqueue(key);
        }
    }

    /// Enqueue everything placed on this target and every mirror it holds.
    async fn resync(&self) {
        let target_key = &self.layout.target_key;

        let placed = ListQuery::all().selector(LabelSelector::exists(intent_label(target_key)));
        match self.upstream.list(&placed).await {
            Ok(objects) => objects.iter().for_each(|obj| self.enqueue(obj.key())),
            Err(e) => warn!(error = %e, "Failed to list placed objects"),
        }

        let mirrors = ListQuery::all()
            .workspace(self.layout.workspace.as_str())
            .selector(LabelSelector::equals(CLUSTER_LABEL, target_key.as_str()));
        match self.downstream.list(&mirrors).await {
            Ok(objects) => objects
                .iter()
                .filter_map(upstream_key_of)
                .for_each(|key| self.enqueue(key)),
            Err(e) => warn!(error = %e, "Failed to list mirrors"),
        }
    }
}
