//! End-to-end placement and sync scenarios.
//!
//! The control plane runs in-process and serves its HTTP API on a loopback
//! port. Each execution target is an in-memory object store behind a
//! switchable link, with a syncer that talks to the control plane over
//! HTTP and reads the control plane's object store as its upstream.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p kplane-e2e --test placement_sync
//! ```

use std::sync::Arc;
use std::time::Duration;

use kplane_api::conditions;
use kplane_api::intent::{self, IntentState};
use kplane_api::kinds::{CONFIGMAPS, EXPORTS, NEGOTIATED_RESOURCES, SERVICES};
use kplane_api::labels::{
    deletion_stuck_annotation, syncer_finalizer, CLUSTER_LABEL, SOURCE_WORKSPACE_ANNOTATION,
};
use kplane_api::wire::TargetHandle;
use kplane_api::{Location, Object, Placement, PlacementPhase, StructuralSchema};
use kplane_control_plane::config::Config;
use kplane_control_plane::stores::Stores;
use kplane_control_plane::{api, ControlPlane};
use kplane_store::{ListQuery, MemoryStore, ObjectKey, ObjectMeta, Resource, Store};
use kplane_syncer::client::HttpControlPlane;
use kplane_syncer::config::Config as SyncConfig;
use kplane_syncer::mirror::MirrorLayout;
use kplane_syncer::schema::SCHEMA_KIND;
use kplane_syncer::Syncer;
use kplane_testing::{eventually, workload, FaultyStore};
use tokio::net::TcpListener;
use tokio::sync::watch;

const LOC_WS: &str = "root:org";
const WS: &str = "root:org:app";
const WS2: &str = "root:org:billing";
const TIMEOUT: Duration = Duration::from_secs(15);

/// Control plane served over loopback HTTP.
struct Harness {
    control_plane: ControlPlane,
    base_url: String,
    client: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
}

/// One execution target and its running syncer.
struct TargetCluster {
    handle: TargetHandle,
    layout: MirrorLayout,
    /// The target's own objects, bypassing the link.
    store: Arc<MemoryStore<Object>>,
    /// What the syncer sees; can be cut.
    link: Arc<FaultyStore<Object>>,
    stop: watch::Sender<bool>,
}

impl Harness {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,kplane_control_plane=debug,kplane_syncer=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let config = Config {
            workers: 2,
            resync_interval: Duration::from_millis(250),
            heartbeat_timeout: Duration::from_secs(2),
            reconcile_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        let control_plane = ControlPlane::new(config, Stores::in_memory());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        control_plane.spawn(shutdown_rx);

        let app = api::create_router(control_plane.app_state());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            control_plane,
            base_url,
            client: reqwest::Client::new(),
            shutdown_tx,
        }
    }

    /// Start a syncer for a new target named `name`, and wait until the
    /// registry reports it ready.
    async fn start_target(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        resources: &[&str],
    ) -> TargetCluster {
        self.start_target_on(name, labels, resources, Arc::new(MemoryStore::new()))
            .await
    }

    async fn start_target_on(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        resources: &[&str],
        store: Arc<MemoryStore<Object>>,
    ) -> TargetCluster {
        let mut config = SyncConfig::local(LOC_WS, name);
        config.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config.resources = resources.iter().map(|k| k.to_string()).collect();
        config.heartbeat_interval = Duration::from_millis(100);
        config.poll_interval = Duration::from_millis(50);
        config.resync_interval = Duration::from_millis(250);
        config.stuck_deletion_after = 2;
        config.workers = 2;
        let downstream_workspace = config.downstream_workspace.clone();

        let link = Arc::new(FaultyStore::<Object>::new(store.clone()));
        let control_plane = Arc::new(HttpControlPlane::new(&self.base_url).unwrap());
        let syncer = Syncer::new(
            config,
            control_plane,
            Arc::clone(&self.control_plane.stores.objects),
            link.clone(),
        );

        let (stop, shutdown) = watch::channel(false);
        let running = syncer.start(shutdown).await.unwrap();
        let handle = running.target;

        let registry = &self.control_plane.registry;
        let uid = handle.uid;
        assert!(
            eventually(TIMEOUT, || async move {
                registry.get(&uid).await.is_ok_and(|t| t.is_ready())
            })
            .await,
            "target {name} never became ready"
        );

        TargetCluster {
            layout: MirrorLayout::new(handle.key.clone(), &downstream_workspace),
            handle,
            store,
            link,
            stop,
        }
    }

    async fn create_location(&self, name: &str, selector: &str, kinds: &[&str]) {
        self.control_plane
            .stores
            .locations
            .create(Location::new(LOC_WS, name, selector).with_required_kinds(kinds))
            .await
            .unwrap();
    }

    async fn available(&self, location: &str) -> Option<u32> {
        let key = ObjectKey::cluster_scoped(kplane_api::kinds::LOCATIONS, LOC_WS, location);
        self.control_plane
            .stores
            .locations
            .get(&key)
            .await
            .unwrap()
            .and_then(|l| l.status.available_instances)
    }

    async fn placement(&self, workspace: &str) -> Option<Placement> {
        self.control_plane.placement.get(workspace).await.unwrap()
    }

    async fn phase(&self, workspace: &str) -> Option<PlacementPhase> {
        self.placement(workspace).await.map(|p| p.status.phase)
    }

    async fn bind(&self, workspace: &str, location: &str) {
        self.control_plane
            .placement
            .bind(workspace, LOC_WS, location)
            .await
            .unwrap();
    }

    async fn create(&self, obj: Object) -> Object {
        self.control_plane.stores.objects.create(obj).await.unwrap()
    }

    async fn object(&self, key: &ObjectKey) -> Option<Object> {
        self.control_plane.stores.objects.get(key).await.unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl TargetCluster {
    async fn mirror(&self, upstream: &ObjectKey) -> Option<Object> {
        self.store
            .get(&self.layout.mirror_key(upstream))
            .await
            .unwrap()
    }

    fn intent(&self, obj: &Object) -> IntentState {
        intent::read(&obj.metadata, &self.handle.key)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_service_is_mirrored_and_removed_through_both_phases() {
    let h = &Harness::new().await;
    let a = &h
        .start_target("cluster-a", &[("env", "prod")], &[SERVICES])
        .await;

    h.create_location("prod", "env=prod", &[SERVICES]).await;
    assert!(
        eventually(TIMEOUT, || async move { h.available("prod").await == Some(1) }).await,
        "location never counted cluster-a"
    );

    h.bind(WS, "prod").await;
    assert!(
        eventually(TIMEOUT, || async move {
            h.phase(WS).await == Some(PlacementPhase::Bound)
        })
        .await,
        "placement never bound"
    );

    let first = h.create(workload(SERVICES, WS, "default", "first")).await;
    let key = &first.key();
    assert!(
        eventually(TIMEOUT, || async move { a.mirror(key).await.is_some() }).await,
        "service was never mirrored"
    );

    let mirror = a.mirror(key).await.unwrap();
    assert_eq!(mirror.metadata.name, "first");
    assert_eq!(
        mirror.metadata.labels.get(CLUSTER_LABEL).map(String::as_str),
        Some(a.handle.key.as_str())
    );
    assert!(!mirror.metadata.labels.keys().any(|k| intent::is_intent_label(k)));
    assert!(mirror.metadata.finalizers.is_empty());

    let upstream = h.object(key).await.unwrap();
    assert_eq!(a.intent(&upstream), IntentState::Sync);
    assert!(upstream
        .metadata
        .has_finalizer(&syncer_finalizer(&a.handle.key)));

    h.control_plane.stores.objects.delete(key).await.unwrap();
    assert!(
        eventually(TIMEOUT, || async move {
            a.mirror(key).await.is_none() && h.object(key).await.is_none()
        })
        .await,
        "mirror or upstream object survived the delete"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_placement_is_never_bound_without_instances() {
    let h = &Harness::new().await;
    h.create_location("prod", "env=prod", &[]).await;
    h.bind(WS, "prod").await;

    assert!(
        eventually(TIMEOUT, || async move {
            h.placement(WS).await.is_some_and(|p| {
                conditions::find(&p.status.conditions, conditions::LOCATION_RESOLVED).is_some()
            })
        })
        .await,
        "placement was never reconciled"
    );
    assert_eq!(h.phase(WS).await, Some(PlacementPhase::Pending));

    // A target outside the selector changes nothing.
    let _dev = h.start_target("cluster-dev", &[("env", "dev")], &[CONFIGMAPS]).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.available("prod").await, Some(0));
    assert_eq!(h.phase(WS).await, Some(PlacementPhase::Pending));

    let prod = h
        .start_target("cluster-prod", &[("env", "prod")], &[CONFIGMAPS])
        .await;
    assert!(
        eventually(TIMEOUT, || async move {
            h.placement(WS).await.is_some_and(|p| {
                p.status.phase == PlacementPhase::Bound
                    && p.status.selected_target.is_some_and(|t| t.name == "cluster-prod")
            })
        })
        .await,
        "placement never bound to cluster-prod"
    );
    assert_eq!(h.available("prod").await, Some(1));

    // Silence the only member; the liveness monitor flips it and the
    // placement must leave Bound as the count drops to zero.
    let _ = prod.stop.send(true);
    assert!(
        eventually(TIMEOUT, || async move {
            h.available("prod").await == Some(0)
                && h.phase(WS).await == Some(PlacementPhase::Unbound)
        })
        .await,
        "placement stayed bound after its only target went silent"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workspaces_mirror_independently() {
    let h = &Harness::new().await;
    let a = &h
        .start_target("cluster-a", &[("env", "prod")], &[CONFIGMAPS])
        .await;
    h.create_location("prod", "env=prod", &[]).await;
    h.bind(WS, "prod").await;
    h.bind(WS2, "prod").await;

    let app = h.create(workload(CONFIGMAPS, WS, "default", "settings")).await;
    let billing = h.create(workload(CONFIGMAPS, WS2, "default", "settings")).await;
    let (app_key, billing_key) = (&app.key(), &billing.key());
    assert!(
        eventually(TIMEOUT, || async move {
            a.mirror(app_key).await.is_some() && a.mirror(billing_key).await.is_some()
        })
        .await,
        "both workspaces should be mirrored"
    );

    let app_mirror = a.mirror(app_key).await.unwrap();
    let billing_mirror = a.mirror(billing_key).await.unwrap();
    assert_ne!(app_mirror.metadata.namespace, billing_mirror.metadata.namespace);
    assert_eq!(
        app_mirror.metadata.annotations.get(SOURCE_WORKSPACE_ANNOTATION).map(String::as_str),
        Some(WS)
    );
    assert_eq!(
        billing_mirror.metadata.annotations.get(SOURCE_WORKSPACE_ANNOTATION).map(String::as_str),
        Some(WS2)
    );

    // Changing one workspace's object leaves the other's mirror alone.
    let mut app = h.object(app_key).await.unwrap();
    app.spec = serde_json::json!({"data": {"mode": "blue"}});
    h.control_plane.stores.objects.update(app).await.unwrap();
    assert!(
        eventually(TIMEOUT, || async move {
            a.mirror(app_key)
                .await
                .is_some_and(|m| m.spec == serde_json::json!({"data": {"mode": "blue"}}))
        })
        .await,
        "spec change never reached the mirror"
    );
    let untouched = a.mirror(billing_key).await.unwrap();
    assert_eq!(untouched.spec, billing_mirror.spec);
    assert_eq!(
        untouched.metadata.resource_version,
        billing_mirror.metadata.resource_version
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deregistered_target_holds_removing_until_reachable() {
    let h = &Harness::new().await;
    let a = &h
        .start_target("cluster-a", &[("env", "prod")], &[CONFIGMAPS])
        .await;
    h.create_location("prod", "env=prod", &[]).await;
    h.bind(WS, "prod").await;

    let one = h.create(workload(CONFIGMAPS, WS, "default", "one")).await;
    let two = h.create(workload(CONFIGMAPS, WS, "default", "two")).await;
    let keys = &[one.key(), two.key()];
    assert!(
        eventually(TIMEOUT, || async move {
            for key in keys {
                if a.mirror(key).await.is_none() {
                    return false;
                }
            }
            true
        })
        .await,
        "both objects should be mirrored"
    );

    a.link.set_unreachable(true);
    let response = h
        .client
        .delete(format!("{}/v1/targets/{}", h.base_url, a.handle.uid))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success(), "deregister failed: {}", response.status());

    let stuck = deletion_stuck_annotation(&a.handle.key);
    let stuck = &stuck;
    assert!(
        eventually(TIMEOUT, || async move {
            for key in keys {
                let Some(obj) = h.object(key).await else {
                    return false;
                };
                if a.intent(&obj) != IntentState::Removing
                    || !obj.metadata.annotations.contains_key(stuck)
                {
                    return false;
                }
            }
            true
        })
        .await,
        "objects should hold Removing and be flagged stuck"
    );
    assert!(
        eventually(TIMEOUT, || async move {
            h.placement(WS).await.is_some_and(|p| {
                conditions::is_true(&p.status.conditions, conditions::DELETION_STUCK)
            })
        })
        .await,
        "placement never reported the stuck deletion"
    );
    for key in keys {
        assert!(a.mirror(key).await.is_some(), "mirror vanished while unreachable");
    }

    a.link.set_unreachable(false);
    assert!(
        eventually(TIMEOUT, || async move {
            for key in keys {
                if a.mirror(key).await.is_some() {
                    return false;
                }
                let Some(obj) = h.object(key).await else {
                    return false;
                };
                if a.intent(&obj) != IntentState::Absent
                    || obj.metadata.annotations.contains_key(stuck)
                    || obj.metadata.has_finalizer(&syncer_finalizer(&a.handle.key))
                {
                    return false;
                }
            }
            true
        })
        .await,
        "removal never completed once the target was reachable"
    );
    assert!(
        eventually(TIMEOUT, || async move {
            h.placement(WS).await.is_some_and(|p| {
                conditions::find(&p.status.conditions, conditions::DELETION_STUCK).is_none()
            })
        })
        .await,
        "stuck condition outlived the deletions"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_negotiated_kind_syncs_to_the_selected_target() {
    let h = &Harness::new().await;
    let schema = StructuralSchema::object([
        ("size", StructuralSchema::Integer),
        ("color", StructuralSchema::String),
    ]);

    let mut clusters = Vec::new();
    for name in ["cluster-a", "cluster-b"] {
        let store = Arc::new(MemoryStore::new());
        store
            .create(Object::new(
                SCHEMA_KIND,
                ObjectMeta::cluster_scoped(format!("{LOC_WS}:{name}"), "widgets"),
                serde_json::to_value(&schema).unwrap(),
            ))
            .await
            .unwrap();
        clusters.push(
            h.start_target_on(name, &[("env", "prod")], &["widgets"], store)
                .await,
        );
    }
    let clusters = &clusters;

    let export_key = &ObjectKey::cluster_scoped(EXPORTS, LOC_WS, "widgets");
    let schema = &schema;
    assert!(
        eventually(TIMEOUT, || async move {
            h.control_plane
                .stores
                .exports
                .get(export_key)
                .await
                .unwrap()
                .is_some_and(|e| e.spec.schema == *schema)
        })
        .await,
        "identical imports should promote to an export"
    );
    let negotiated = h
        .control_plane
        .stores
        .negotiated
        .get(&ObjectKey::cluster_scoped(NEGOTIATED_RESOURCES, LOC_WS, "widgets"))
        .await
        .unwrap()
        .unwrap();
    assert!(conditions::is_true(&negotiated.status.conditions, conditions::COMPATIBLE));

    h.create_location("prod", "env=prod", &["widgets"]).await;
    h.bind(WS, "prod").await;
    let widget = h.create(workload("widgets", WS, "default", "gizmo")).await;
    let key = &widget.key();

    let selected = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(target) = h.placement(WS).await.and_then(|p| p.status.selected_target) {
                return target;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("placement never selected a target");
    let (chosen, other): (Vec<_>, Vec<_>) = clusters
        .iter()
        .partition(|c| c.handle.uid == selected.uid);
    let (chosen, other) = (chosen[0], other[0]);

    assert!(
        eventually(TIMEOUT, || async move { chosen.mirror(key).await.is_some() }).await,
        "widget never reached {}",
        chosen.handle.name
    );
    assert!(other.mirror(key).await.is_none());
    assert_eq!(
        other
            .store
            .list(&ListQuery::all().kind("widgets"))
            .await
            .unwrap()
            .len(),
        0
    );
}
