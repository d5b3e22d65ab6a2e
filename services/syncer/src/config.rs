//! Configuration for the syncer.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kplane_api::kinds::{CONFIGMAPS, SECRETS};

/// Syncer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name the target registers under.
    pub target_name: String,

    /// Workspace the target registers in.
    pub target_workspace: String,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Object API the upstream workspaces are served from.
    pub upstream_url: String,

    /// Object API of the target cluster.
    pub downstream_url: String,

    /// Workspace of the target cluster that mirrors are written to.
    pub downstream_workspace: String,

    /// Kinds to sync. Non-native kinds are negotiated first.
    pub resources: Vec<String>,

    /// Labels the target registers with; locations select on these.
    pub labels: BTreeMap<String, String>,

    pub heartbeat_interval: Duration,

    /// Worker pool size for each reconciler.
    pub workers: usize,

    /// Failed downstream deletions before the object is flagged as stuck.
    pub stuck_deletion_after: u32,

    /// How often remote stores are polled for changes.
    pub poll_interval: Duration,

    pub resync_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let target_name =
            std::env::var("KPLANE_SYNC_TARGET_NAME").context("KPLANE_SYNC_TARGET_NAME is required")?;
        let target_workspace = std::env::var("KPLANE_SYNC_TARGET_WORKSPACE")
            .context("KPLANE_SYNC_TARGET_WORKSPACE is required")?;

        let control_plane_url = std::env::var("KPLANE_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
        let upstream_url =
            std::env::var("KPLANE_UPSTREAM_URL").unwrap_or_else(|_| control_plane_url.clone());
        let downstream_url =
            std::env::var("KPLANE_DOWNSTREAM_URL").context("KPLANE_DOWNSTREAM_URL is required")?;
        let downstream_workspace = std::env::var("KPLANE_DOWNSTREAM_WORKSPACE")
            .unwrap_or_else(|_| format!("{target_workspace}:{target_name}"));

        let resources = match std::env::var("KPLANE_RESOURCES") {
            Ok(list) => parse_list(&list),
            Err(_) => vec![CONFIGMAPS.to_string(), SECRETS.to_string()],
        };
        let labels = match std::env::var("KPLANE_TARGET_LABELS") {
            Ok(list) => parse_labels(&list)?,
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            target_name,
            target_workspace,
            control_plane_url,
            upstream_url,
            downstream_url,
            downstream_workspace,
            resources,
            labels,
            heartbeat_interval: Duration::from_secs(env_number("KPLANE_HEARTBEAT_INTERVAL_SECS", 10)?),
            workers: env_number("KPLANE_WORKERS", 4)? as usize,
            stuck_deletion_after: env_number("KPLANE_STUCK_DELETION_AFTER", 5)? as u32,
            poll_interval: Duration::from_millis(env_number("KPLANE_POLL_INTERVAL_MS", 1000)?),
            resync_interval: Duration::from_secs(env_number("KPLANE_RESYNC_INTERVAL_SECS", 30)?),
            log_level: std::env::var("KPLANE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Defaults for a target named `name` in `workspace`, without remote
    /// endpoints. Used when the syncer is wired to in-process stores.
    pub fn local(workspace: &str, name: &str) -> Self {
        Self {
            target_name: name.to_string(),
            target_workspace: workspace.to_string(),
            control_plane_url: String::new(),
            upstream_url: String::new(),
            downstream_url: String::new(),
            downstream_workspace: format!("{workspace}:{name}"),
            resources: vec![CONFIGMAPS.to_string(), SECRETS.to_string()],
            labels: BTreeMap::new(),
            heartbeat_interval: Duration::from_secs(10),
            workers: 4,
            stuck_deletion_after: 5,
            poll_interval: Duration::from_secs(1),
            resync_interval: kplane_reconcile::DEFAULT_RESYNC_INTERVAL,
            log_level: "info".to_string(),
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

fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `k=v,k2=v2`.
fn parse_labels(list: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in parse_list(list) {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("KPLANE_TARGET_LABELS: expected key=value, got '{pair}'");
        };
        labels.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_parse_list_skips_blanks() {
        assert_eq!(
            parse_list("configmaps, services,,widgets "),
            vec!["configmaps", "services", "widgets"]
        );
    }

    #[rstest]
    #[case("region=eu, tier = gold", &[("region", "eu"), ("tier", "gold")])]
    #[case("", &[])]
    #[case("env=prod,env=dev", &[("env", "dev")])]
    fn test_parse_labels(#[case] input: &str, #[case] expected: &[(&str, &str)]) {
        let labels = parse_labels(input).unwrap();
        let expected: BTreeMap<String, String> = expected
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(labels, expected);
    }

    #[rstest]
    #[case("region")]
    #[case("a=b,c")]
    fn test_parse_labels_rejects_bare_keys(#[case] input: &str) {
        assert!(parse_labels(input).is_err());
    }
}
