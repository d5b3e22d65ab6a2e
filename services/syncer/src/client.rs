//! Control plane API client for the syncer.
//!
//! Covers what a sync agent asks of the control plane:
//! - Registering its target and sending heartbeats
//! - Publishing resource imports and polling kind availability

use std::time::Duration;

use async_trait::async_trait;
use kplane_api::wire::{Heartbeat, KindAvailability, Registration, TargetHandle};
use kplane_api::ResourceImport;
use kplane_id::ObjectUid;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

use crate::error::SyncError;

/// The control plane as seen by one syncer.
#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<TargetHandle, SyncError>;

    async fn heartbeat(&self, uid: &ObjectUid, heartbeat: &Heartbeat) -> Result<(), SyncError>;

    async fn publish_import(&self, import: &ResourceImport) -> Result<(), SyncError>;

    /// Availability of `kind` in `workspace`, with the verdict on the import
    /// published by `target_name`.
    async fn kind_availability(
        &self,
        workspace: &str,
        kind: &str,
        target_name: &str,
    ) -> Result<KindAvailability, SyncError>;
}

/// Error body returned by the control plane.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Problem {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Turn a non-success response into a [`SyncError::ControlPlane`].
pub(crate) async fn problem_error(response: reqwest::Response) -> SyncError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let problem: Problem = serde_json::from_str(&body).unwrap_or_else(|_| Problem {
        detail: body,
        ..Problem::default()
    });
    SyncError::ControlPlane {
        status,
        code: problem.code,
        detail: problem.detail,
        retryable: problem.retryable,
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, SyncError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Control plane client over its HTTP API.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        what: &'static str,
    ) -> Result<T, SyncError> {
        if !response.status().is_success() {
            let err = problem_error(response).await;
            error!(error = %err, "Failed to {what}");
            return Err(err);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ControlPlaneApi for HttpControlPlane {
    async fn register(&self, registration: &Registration) -> Result<TargetHandle, SyncError> {
        let url = format!("{}/v1/targets", self.base_url);
        debug!(url = %url, name = %registration.name, "Registering target");

        let response = self.client.post(&url).json(registration).send().await?;
        self.read(response, "register target").await
    }

    async fn heartbeat(&self, uid: &ObjectUid, heartbeat: &Heartbeat) -> Result<(), SyncError> {
        let url = format!("{}/v1/targets/{}/heartbeat", self.base_url, uid);

        let response = self
            .client
            .post(&url)
            .json(heartbeat)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(problem_error(response).await);
        }
        Ok(())
    }

    async fn publish_import(&self, import: &ResourceImport) -> Result<(), SyncError> {
        let url = format!("{}/v1/imports", self.base_url);
        debug!(kind = %import.spec.kind, "Publishing resource import");

        let response = self.client.post(&url).json(import).send().await?;
        let _: ResourceImport = self.read(response, "publish import").await?;
        Ok(())
    }

    async fn kind_availability(
        &self,
        workspace: &str,
        kind: &str,
        target_name: &str,
    ) -> Result<KindAvailability, SyncError> {
        let url = format!("{}/v1/kinds/{}", self.base_url, kind);

        let response = self
            .client
            .get(&url)
            .query(&[("workspace", workspace), ("target", target_name)])
            .send()
            .await?;
        self.read(response, "read kind availability").await
    }
}
