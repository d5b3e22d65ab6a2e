//! Object store reached over the control plane's object API.
//!
//! Writes map straight onto `/v1/objects`. The API has no streaming watch,
//! so [`RemoteStore::run_poller`] lists the watched scope periodically and
//! turns the difference between two snapshots into watch events.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kplane_api::wire::ListResponse;
use kplane_api::Object;
use kplane_store::{ListQuery, ObjectKey, Resource, Store, StoreError, StoreResult, WatchEvent};
use reqwest::StatusCode;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::client::{http_client, Problem};
use crate::error::SyncError;

const WATCH_CHANNEL_CAPACITY: usize = 1024;

pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    /// What the poller lists to produce watch events.
    scope: ListQuery,
    events: broadcast::Sender<WatchEvent<Object>>,
}

impl RemoteStore {
    pub fn new(base_url: &str, scope: ListQuery) -> Result<Self, SyncError> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            base_url: base_url.trim_end_matches('/').to_string(),
            scope,
            events,
        })
    }

    fn objects_url(&self) -> String {
        format!("{}/v1/objects", self.base_url)
    }

    fn object_url(&self, key: &ObjectKey) -> String {
        format!(
            "{}/v1/objects/{}/{}/{}",
            self.base_url, key.kind, key.workspace, key.name
        )
    }

    /// Poll the watched scope every `interval` until shutdown.
    pub async fn run_poller(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.base_url, interval_ms = interval.as_millis() as u64, "Starting remote poller");

        let mut known = BTreeMap::new();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&mut known).await {
                        warn!(url = %self.base_url, error = %e, "Remote poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(url = %self.base_url, "Remote poller stopped");
    }

    /// List the scope once and emit an event for every difference from
    /// `known`, which is then replaced by the new snapshot.
    pub async fn poll_once(&self, known: &mut BTreeMap<ObjectKey, Object>) -> StoreResult<usize> {
        let current: BTreeMap<ObjectKey, Object> = self
            .list(&self.scope)
            .await?
            .into_iter()
            .map(|obj| (obj.key(), obj))
            .collect();

        let mut emitted = 0;
        for (key, obj) in &current {
            let event = match known.get(key) {
                None => WatchEvent::Added(obj.clone()),
                Some(prev) if prev.metadata.resource_version != obj.metadata.resource_version => {
                    WatchEvent::Modified(obj.clone())
                }
                Some(_) => continue,
            };
            let _ = self.events.send(event);
            emitted += 1;
        }
        for (key, obj) in known.iter() {
            if !current.contains_key(key) {
                let _ = self.events.send(WatchEvent::Deleted(obj.clone()));
                emitted += 1;
            }
        }

        *known = current;
        Ok(emitted)
    }

    async fn read_object(&self, response: reqwest::Response) -> StoreResult<Object> {
        if !response.status().is_success() {
            return Err(store_error(response).await);
        }
        response.json().await.map_err(unavailable)
    }
}

fn unavailable(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Map an API error response back onto the store error it came from.
async fn store_error(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let problem: Problem = serde_json::from_str(&body).unwrap_or_else(|_| Problem {
        detail: body,
        ..Problem::default()
    });

    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(problem.detail),
        StatusCode::CONFLICT if problem.code == "already_exists" => {
            StoreError::AlreadyExists(problem.detail)
        }
        StatusCode::CONFLICT => StoreError::Conflict {
            key: problem.detail,
            expected: 0,
            actual: 0,
        },
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => StoreError::Invalid(problem.detail),
        _ => StoreError::Unavailable(format!("{status}: {}", problem.detail)),
    }
}

#[async_trait]
impl Store<Object> for RemoteStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Object>> {
        let response = self
            .client
            .get(self.object_url(key))
            .query(&[("namespace", key.namespace.as_str())])
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.read_object(response).await.map(Some)
    }

    async fn list(&self, query: &ListQuery) -> StoreResult<Vec<Object>> {
        let response = self
            .client
            .get(self.objects_url())
            .query(query)
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            return Err(store_error(response).await);
        }
        let list: ListResponse<Object> = response.json().await.map_err(unavailable)?;
        Ok(list.items)
    }

    async fn create(&self, obj: Object) -> StoreResult<Object> {
        let response = self
            .client
            .post(self.objects_url())
            .json(&obj)
            .send()
            .await
            .map_err(unavailable)?;
        self.read_object(response).await
    }

    async fn update(&self, obj: Object) -> StoreResult<Object> {
        let response = self
            .client
            .put(self.objects_url())
            .json(&obj)
            .send()
            .await
            .map_err(unavailable)?;
        self.read_object(response).await
    }

    async fn update_status(&self, obj: Object) -> StoreResult<Object> {
        let response = self
            .client
            .put(format!("{}/status", self.objects_url()))
            .json(&obj)
            .send()
            .await
            .map_err(unavailable)?;
        self.read_object(response).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let response = self
            .client
            .delete(self.object_url(key))
            .query(&[("namespace", key.namespace.as_str())])
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            return Err(store_error(response).await);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<Object>> {
        self.events.subscribe()
    }
}
