//! Downstream to upstream status reconcile.
//!
//! Copies the status the target observed on a mirror onto the upstream
//! object through `update_status`, so the upstream spec is never touched.

use std::sync::Arc;

use kplane_api::intent::{self, IntentState};
use kplane_api::{KindRegistry, Object};
use kplane_reconcile::{retry_on_conflict, BackoffPolicy, Outcome, CONFLICT_ATTEMPTS};
use kplane_store::{ObjectKey, Store};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::error::SyncError;
use crate::mirror::MirrorLayout;

pub struct StatusReconciler {
    layout: MirrorLayout,
    upstream: Arc<dyn Store<Object>>,
    downstream: Arc<dyn Store<Object>>,
    kinds: Arc<RwLock<KindRegistry>>,
}

impl StatusReconciler {
    pub fn new(
        layout: MirrorLayout,
        upstream: Arc<dyn Store<Object>>,
        downstream: Arc<dyn Store<Object>>,
        kinds: Arc<RwLock<KindRegistry>>,
    ) -> Self {
        Self {
            layout,
            upstream,
            downstream,
            kinds,
        }
    }

    #[instrument(skip(self), fields(target_key = %self.layout.target_key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, SyncError> {
        let Some(obj) = self.upstream.get(key).await? else {
            return Ok(Outcome::Done);
        };
        let syncable = self.kinds.read().await.get(&obj.kind);
        let Some(syncable) = syncable else {
            return Ok(Outcome::Done);
        };
        if !syncable.has_status()
            || intent::read(&obj.metadata, &self.layout.target_key) != IntentState::Sync
        {
            return Ok(Outcome::Done);
        }

        let Some(mirror) = self.downstream.get(&self.layout.mirror_key(key)).await? else {
            return Ok(Outcome::Done);
        };
        let observed = syncable.status(&mirror).cloned();
        if syncable.status(&obj) == observed.as_ref() {
            return Ok(Outcome::Done);
        }

        let observed = &observed;
        let syncable = syncable.as_ref();
        let written = retry_on_conflict::<_, SyncError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                let Some(mut current) = self.upstream.get(key).await? else {
                    return Ok(false);
                };
                if syncable.status(&current) == observed.as_ref() {
                    return Ok(false);
                }
                syncable.set_status(&mut current, observed.clone());
                self.upstream.update_status(current).await?;
                Ok(true)
            },
        )
        .await?;

        if written {
            debug!(%key, "Status copied upstream");
        }
        Ok(Outcome::Done)
    }
}
