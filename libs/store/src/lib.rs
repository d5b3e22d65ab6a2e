//! # kplane-store
//!
//! The object storage and watch capability every kplane component builds on.
//!
//! Components never share in-memory state; they read and write resources
//! through a [`Store`] and react to its watch stream. The contract mirrors a
//! Kubernetes-style API server:
//!
//! - Every write bumps a monotonically increasing `resource_version`
//! - `update`/`update_status` are compare-and-swap on that version and fail
//!   with [`StoreError::Conflict`] when it is stale
//! - `update` never changes the status subtree; `update_status` never changes
//!   anything else
//! - Deleting an object with finalizers only sets its deletion timestamp; the
//!   object disappears once the last finalizer is removed
//!
//! [`MemoryStore`] is the in-process implementation.

mod error;
mod memory;
mod meta;
mod selector;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use meta::{ListQuery, ObjectKey, ObjectMeta, Resource, WatchEvent};
pub use selector::{LabelSelector, Requirement, SelectorError};

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Storage and watch capability for one resource type.
#[async_trait]
pub trait Store<T: Resource>: Send + Sync {
    /// Fetch an object by key.
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<T>>;

    /// List objects matching a query, ordered by key.
    async fn list(&self, query: &ListQuery) -> StoreResult<Vec<T>>;

    /// Create an object. Fails with `AlreadyExists` if the key is taken.
    async fn create(&self, obj: T) -> StoreResult<T>;

    /// Replace everything but the status subtree, compare-and-swap on
    /// `resource_version`.
    async fn update(&self, obj: T) -> StoreResult<T>;

    /// Replace only the status subtree, compare-and-swap on
    /// `resource_version`.
    async fn update_status(&self, obj: T) -> StoreResult<T>;

    /// Delete an object, or mark it terminating while finalizers remain.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    /// Subscribe to changes made after this call.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}
