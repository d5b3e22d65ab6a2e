//! kplane control plane.
//!
//! Serves the HTTP API and runs the target registry, location resolver,
//! placement engine, schema negotiator and liveness monitor over in-memory
//! stores.

use anyhow::Result;
use kplane_control_plane::{api, config, stores::Stores, ControlPlane};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to KPLANE_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kplane control plane");
    info!(
        listen_addr = %config.listen_addr,
        workers = config.workers,
        resync_secs = config.resync_interval.as_secs(),
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_plane = ControlPlane::new(config.clone(), Stores::in_memory());
    let workers = control_plane.spawn(shutdown_rx.clone());
    let app = api::create_router(control_plane.app_state());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for controllers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    for worker in workers {
        if tokio::time::timeout(shutdown_timeout, worker).await.is_err() {
            warn!("Controller did not shut down in time");
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
