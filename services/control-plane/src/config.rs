use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Worker pool size for each controller.
    pub workers: usize,
    pub resync_interval: Duration,
    /// A target whose last heartbeat is older than this is marked `NotReady`.
    pub heartbeat_timeout: Duration,
    pub reconcile_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("KPLANE_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("KPLANE_LISTEN_ADDR")?;

        let log_level = std::env::var("KPLANE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let workers = env_number("KPLANE_WORKERS", 4)? as usize;
        let resync_interval = Duration::from_secs(env_number("KPLANE_RESYNC_INTERVAL_SECS", 30)?);
        let heartbeat_timeout =
            Duration::from_secs(env_number("KPLANE_HEARTBEAT_TIMEOUT_SECS", 40)?);
        let reconcile_timeout =
            Duration::from_secs(env_number("KPLANE_RECONCILE_TIMEOUT_SECS", 30)?);

        Ok(Self {
            listen_addr,
            log_level,
            workers,
            resync_interval,
            heartbeat_timeout,
            reconcile_timeout,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            workers: 4,
            resync_interval: kplane_reconcile::DEFAULT_RESYNC_INTERVAL,
            heartbeat_timeout: Duration::from_secs(40),
            reconcile_timeout: kplane_reconcile::DEFAULT_RECONCILE_TIMEOUT,
        }
    }
}

fn env_number(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} must be a number, got '{value}'")),
        Err(_) => Ok(default),
    }
}
