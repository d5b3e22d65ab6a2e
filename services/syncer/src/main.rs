//! kplane syncer.
//!
//! Registers one execution target with the control plane and keeps the
//! workload placed on it in sync with the target's object API.

use std::sync::Arc;

use anyhow::Result;
use kplane_api::labels::{intent_label, CLUSTER_LABEL};
use kplane_store::{LabelSelector, ListQuery};
use kplane_syncer::client::HttpControlPlane;
use kplane_syncer::config::Config;
use kplane_syncer::remote::RemoteStore;
use kplane_syncer::Syncer;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to KPLANE_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kplane syncer");
    info!(
        target_workspace = %config.target_workspace,
        target_name = %config.target_name,
        control_plane_url = %config.control_plane_url,
        downstream_url = %config.downstream_url,
        downstream_workspace = %config.downstream_workspace,
        resources = ?config.resources,
        "Configuration loaded"
    );

    let target_key = Syncer::target_key(&config);
    let upstream = Arc::new(RemoteStore::new(
        &config.upstream_url,
        ListQuery::all().selector(LabelSelector::exists(intent_label(&target_key))),
    )?);
    let downstream = Arc::new(RemoteStore::new(
        &config.downstream_url,
        ListQuery::all()
            .workspace(config.downstream_workspace.as_str())
            .selector(LabelSelector::equals(CLUSTER_LABEL, target_key.as_str())),
    )?);
    let control_plane = Arc::new(HttpControlPlane::new(&config.control_plane_url)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    for store in [Arc::clone(&upstream), Arc::clone(&downstream)] {
        let shutdown = shutdown_rx.clone();
        let interval = config.poll_interval;
        tasks.push(tokio::spawn(async move {
            store.run_poller(interval, shutdown).await
        }));
    }

    let syncer = Syncer::new(config, control_plane, upstream, downstream);
    let running = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal before registration completed");
            let _ = shutdown_tx.send(true);
            return Ok(());
        }
        running = syncer.start(shutdown_rx) => running?,
    };
    info!(uid = %running.target.uid, target_key = %running.target.key, "Syncer running");
    tasks.extend(running.tasks);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    info!("Waiting for sync loops to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    for task in tasks {
        if tokio::time::timeout(shutdown_timeout, task).await.is_err() {
            warn!("Sync loop did not shut down in time");
        }
    }

    info!("Syncer shutdown complete");
    Ok(())
}
