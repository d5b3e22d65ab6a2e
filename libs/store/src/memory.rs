//! In-process [`Store`] implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use kplane_id::ObjectUid;
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

use crate::{ListQuery, ObjectKey, Resource, Store, StoreError, StoreResult, WatchEvent};

const WATCH_CAPACITY: usize = 1024;

struct Inner<T> {
    objects: BTreeMap<ObjectKey, T>,
    last_version: u64,
}

impl<T> Inner<T> {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

/// A store holding objects in memory, ordered by key.
///
/// Watch events are broadcast while the write lock is held, so subscribers
/// observe them in resource-version order.
pub struct MemoryStore<T> {
    inner: RwLock<Inner<T>>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Resource> MemoryStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                objects: BTreeMap::new(),
                last_version: 0,
            }),
            events,
        }
    }

    /// Number of stored objects, terminating ones included.
    pub async fn len(&self) -> usize {
        self.inner.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn emit(&self, event: WatchEvent<T>) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn check_version(key: &ObjectKey, expected: u64, current: &T) -> StoreResult<()> {
        let actual = current.meta().resource_version;
        if expected != actual {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

impl<T: Resource> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Resource> Store<T> for MemoryStore<T> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<T>> {
        Ok(self.inner.read().await.objects.get(key).cloned())
    }

    async fn list(&self, query: &ListQuery) -> StoreResult<Vec<T>> {
        let inner = self.inner.read().await;
        Ok(inner
            .objects
            .values()
            .filter(|obj| query.matches(*obj))
            .cloned()
            .collect())
    }

    async fn create(&self, mut obj: T) -> StoreResult<T> {
        let key = obj.key();
        if key.name.is_empty() {
            return Err(StoreError::Invalid(format!("{key}: name is required")));
        }

        let mut inner = self.inner.write().await;
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }

        let version = inner.next_version();
        let meta = obj.meta_mut();
        meta.uid = Some(ObjectUid::new());
        meta.resource_version = version;
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;

        trace!(%key, version, "created");
        inner.objects.insert(key, obj.clone());
        self.emit(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, mut obj: T) -> StoreResult<T> {
        let key = obj.key();
        let mut inner = self.inner.write().await;
        let current = inner
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_version(&key, obj.meta().resource_version, current)?;

        obj.set_status_from(current);
        let (uid, created, deleted) = {
            let meta = current.meta();
            (
                meta.uid,
                meta.creation_timestamp,
                meta.deletion_timestamp,
            )
        };

        let version = inner.next_version();
        let meta = obj.meta_mut();
        meta.uid = uid;
        meta.creation_timestamp = created;
        meta.deletion_timestamp = deleted;
        meta.resource_version = version;

        if meta.is_terminating() && meta.finalizers.is_empty() {
            trace!(%key, version, "last finalizer removed");
            inner.objects.remove(&key);
            self.emit(WatchEvent::Deleted(obj.clone()));
            return Ok(obj);
        }

        trace!(%key, version, "updated");
        inner.objects.insert(key, obj.clone());
        self.emit(WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    async fn update_status(&self, obj: T) -> StoreResult<T> {
        let key = obj.key();
        let mut inner = self.inner.write().await;
        let current = inner
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_version(&key, obj.meta().resource_version, current)?;

        let mut updated = current.clone();
        updated.set_status_from(&obj);
        let version = inner.next_version();
        updated.meta_mut().resource_version = version;

        trace!(%key, version, "status updated");
        inner.objects.insert(key, updated.clone());
        self.emit(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let Some(current) = inner.objects.get(key) else {
            return Err(StoreError::NotFound(key.to_string()));
        };

        if current.meta().finalizers.is_empty() {
            let removed = inner.objects.remove(key);
            if let Some(removed) = removed {
                trace!(%key, "deleted");
                self.emit(WatchEvent::Deleted(removed));
            }
            return Ok(());
        }

        if current.meta().is_terminating() {
            return Ok(());
        }

        let mut terminating = current.clone();
        let version = inner.next_version();
        let meta = terminating.meta_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version = version;

        trace!(%key, version, finalizers = ?meta.finalizers, "marked terminating");
        inner.objects.insert(key.clone(), terminating.clone());
        self.emit(WatchEvent::Modified(terminating));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}
