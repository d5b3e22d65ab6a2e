//! Shared test helpers.
//!
//! - [`FaultyStore`]: wraps a store and fails every call while switched off
//! - [`eventually`]: polls an async condition until it holds
//! - fixtures for ready targets and workload objects

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kplane_api::conditions::{self, Condition, ConditionStatus};
use kplane_api::{ExecutionTarget, Object};
use kplane_store::{
    ListQuery, ObjectKey, ObjectMeta, Resource, Store, StoreError, StoreResult, WatchEvent,
};
use tokio::sync::broadcast;

/// A store that can be made unreachable.
pub struct FaultyStore<T> {
    inner: Arc<dyn Store<T>>,
    down: AtomicBool,
}

impl<T: Resource> FaultyStore<T> {
    pub fn new(inner: Arc<dyn Store<T>>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_unreachable(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Resource> Store<T> for FaultyStore<T> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<T>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn list(&self, query: &ListQuery) -> StoreResult<Vec<T>> {
        self.check()?;
        self.inner.list(query).await
    }

    async fn create(&self, obj: T) -> StoreResult<T> {
        self.check()?;
        self.inner.create(obj).await
    }

    async fn update(&self, obj: T) -> StoreResult<T> {
        self.check()?;
        self.inner.update(obj).await
    }

    async fn update_status(&self, obj: T) -> StoreResult<T> {
        self.check()?;
        self.inner.update_status(obj).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.inner.watch()
    }
}

/// Poll `condition` every 10ms until it returns true or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A target that has just reported `Ready`.
pub fn ready_target(
    workspace: &str,
    name: &str,
    labels: &[(&str, &str)],
    kinds: &[&str],
) -> ExecutionTarget {
    let kinds = kinds.iter().map(|k| k.to_string()).collect();
    let mut target = ExecutionTarget::new(workspace, name, kinds);
    for (k, v) in labels {
        target.metadata.labels.insert(k.to_string(), v.to_string());
    }
    conditions::set(
        &mut target.status.conditions,
        Condition::new(conditions::READY, ConditionStatus::True).with_reason("HeartbeatReceived"),
    );
    target.status.last_heartbeat = Some(Utc::now());
    target
}

/// A namespaced workload object with an empty-ish spec.
pub fn workload(kind: &str, workspace: &str, namespace: &str, name: &str) -> Object {
    Object::new(
        kind,
        ObjectMeta::namespaced(workspace, namespace, name),
        serde_json::json!({"ports": [{"port": 80}]}),
    )
}
