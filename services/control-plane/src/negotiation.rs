//! Schema negotiation.
//!
//! Syncers publish the schema of every kind they were asked to mirror but
//! the workspace does not know natively, as one `ResourceImport` per kind
//! and target. For each kind the negotiator merges all imports into a
//! `NegotiatedResource`. Once every import is compatible it promotes the
//! merged schema to an `Export` and binds it into the same workspace.
//!
//! Conflicting field types never promote. The conflict is written as a
//! `Compatible=False` condition on the negotiated resource and on each
//! offending import. The kind is looked at again after a delay that grows
//! with each consecutive conflict, up to a cap; an import change triggers a
//! new attempt right away. An export that already exists is left as it is
//! when a later import conflicts with it.

use std::sync::Arc;
use std::time::Duration;

use kplane_api::conditions::{self, Condition, ConditionStatus};
use kplane_api::kinds::{BINDINGS, EXPORTS, NEGOTIATED_RESOURCES, RESOURCE_IMPORTS};
use kplane_api::wire::KindAvailability;
use kplane_api::{
    Binding, Export, KindRegistry, NegotiatedResource, ResourceImport, StructuralSchema,
};
use kplane_id::{validate_dns_label, WorkspaceName};
use kplane_reconcile::{
    forward_events, resync_every, retry_on_conflict, run_workers, BackoffPolicy, Outcome,
    RetryTracker, RetryableError, WorkQueue, WorkerConfig, CONFLICT_ATTEMPTS,
};
use kplane_store::{ListQuery, ObjectKey, Resource, Store, StoreError};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};

use crate::stores::Stores;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("invalid import: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RetryableError for NegotiationError {
    fn is_transient(&self) -> bool {
        match self {
            NegotiationError::Invalid(_) => false,
            NegotiationError::Store(e) => e.is_transient(),
        }
    }

    fn is_conflict(&self) -> bool {
        matches!(self, NegotiationError::Store(e) if e.is_conflict())
    }
}

/// Work item: one kind in one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KindKey {
    pub workspace: String,
    pub kind: String,
}

/// Consecutive conflicts are counted within this window.
const CONFLICT_WINDOW: Duration = Duration::from_secs(3600);

impl std::fmt::Display for KindKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workspace, self.kind)
    }
}

pub struct Negotiator {
    stores: Stores,
    queue: WorkQueue<KindKey>,
    conflicts: Mutex<RetryTracker>,
    conflict_backoff: BackoffPolicy,
}

impl Negotiator {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            queue: WorkQueue::new(BackoffPolicy {
                base: Duration::from_millis(200),
                max: Duration::from_secs(300),
                jitter: 0.25,
            }),
            conflicts: Mutex::new(RetryTracker::new(u32::MAX, CONFLICT_WINDOW)),
            conflict_backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(300),
                jitter: 0.25,
            },
        }
    }

    /// Create or replace the import of a kind from one target.
    #[instrument(skip(self, import), fields(kind = %import.spec.kind, target = %import.spec.target_name))]
    pub async fn publish(&self, import: ResourceImport) -> Result<ResourceImport, NegotiationError> {
        WorkspaceName::parse(&import.metadata.workspace)
            .map_err(|e| NegotiationError::Invalid(e.to_string()))?;
        validate_dns_label(&import.spec.kind).map_err(NegotiationError::Invalid)?;
        validate_dns_label(&import.spec.target_name).map_err(NegotiationError::Invalid)?;
        if KindRegistry::is_native(&import.spec.kind) {
            return Err(NegotiationError::Invalid(format!(
                "{} is native and needs no negotiation",
                import.spec.kind
            )));
        }

        let desired = ResourceImport::new(
            &import.metadata.workspace,
            &import.spec.target_name,
            &import.spec.kind,
            import.spec.schema,
        );
        let key = desired.key();
        let (desired, key) = (&desired, &key);
        let stored = retry_on_conflict::<_, NegotiationError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                match self.stores.imports.get(key).await? {
                    Some(existing) if existing.spec == desired.spec => Ok(existing),
                    Some(mut existing) => {
                        // A changed schema has no verdict until negotiated again.
                        if conditions::remove(&mut existing.status.conditions, conditions::COMPATIBLE) {
                            existing = self.stores.imports.update_status(existing).await?;
                        }
                        existing.spec = desired.spec.clone();
                        Ok(self.stores.imports.update(existing).await?)
                    }
                    None => Ok(self.stores.imports.create(desired.clone()).await?),
                }
            },
        )
        .await?;

        self.queue.add(KindKey {
            workspace: stored.metadata.workspace.clone(),
            kind: stored.spec.kind.clone(),
        });
        Ok(stored)
    }

    /// Availability of `kind` in `workspace`. With `target_name`, also the
    /// verdict on that target's own import.
    pub async fn availability(
        &self,
        workspace: &str,
        kind: &str,
        target_name: Option<&str>,
    ) -> Result<KindAvailability, NegotiationError> {
        let exported = self
            .stores
            .exports
            .get(&ObjectKey::cluster_scoped(EXPORTS, workspace, kind))
            .await?
            .is_some();
        let bound = self
            .stores
            .bindings
            .get(&ObjectKey::cluster_scoped(BINDINGS, workspace, kind))
            .await?
            .is_some();
        let conflict = self
            .stores
            .negotiated
            .get(&ObjectKey::cluster_scoped(NEGOTIATED_RESOURCES, workspace, kind))
            .await?
            .and_then(|nr| {
                conditions::find(&nr.status.conditions, conditions::COMPATIBLE)
                    .filter(|c| !c.is_true())
                    .map(|c| c.message.clone())
            });
        let import_compatible = match target_name {
            Some(target) => self
                .stores
                .imports
                .get(&ObjectKey::cluster_scoped(
                    RESOURCE_IMPORTS,
                    workspace,
                    format!("{kind}.{target}"),
                ))
                .await?
                .and_then(|import| {
                    conditions::find(&import.status.conditions, conditions::COMPATIBLE)
                        .map(|c| c.is_true())
                }),
            None => None,
        };

        Ok(KindAvailability {
            kind: kind.to_string(),
            native: KindRegistry::is_native(kind),
            exported,
            bound,
            conflict,
            import_compatible,
        })
    }

    pub async fn run(
        self: Arc<Self>,
        config: WorkerConfig,
        resync_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        let events = {
            let queue = self.queue.clone();
            let events = self.stores.imports.watch();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                forward_events("negotiator", events, shutdown, |event| {
                    let import = event.object();
                    queue.add(KindKey {
                        workspace: import.metadata.workspace.clone(),
                        kind: import.spec.kind.clone(),
                    });
                    std::future::ready(())
                })
                .await;
            })
        };

        let resync = {
            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                resync_every(resync_interval, shutdown, || {
                    let this = Arc::clone(&this);
                    async move { this.enqueue_all().await }
                })
                .await;
            })
        };

        let this = Arc::clone(&self);
        run_workers(
            self.queue.clone(),
            config,
            move |key: KindKey| {
                let this = Arc::clone(&this);
                async move { this.reconcile(&key).await }
            },
            shutdown,
        )
        .await;

        let _ = events.await;
        let _ = resync.await;
    }

    async fn enqueue_all(&self) {
        match self.stores.imports.list(&ListQuery::all()).await {
            Ok(imports) => {
                for import in imports {
                    self.queue.add(KindKey {
                        workspace: import.metadata.workspace,
                        kind: import.spec.kind,
                    });
                }
            }
            Err(e) => warn!(error = %e, "Failed to list imports for resync"),
        }
    }

    /// Negotiate one kind.
    #[instrument(skip(self), fields(workspace = %key.workspace, kind = %key.kind))]
    pub async fn reconcile(&self, key: &KindKey) -> Result<Outcome, NegotiationError> {
        let imports: Vec<ResourceImport> = self
            .stores
            .imports
            .list(&ListQuery::all().kind(RESOURCE_IMPORTS).workspace(&key.workspace))
            .await?
            .into_iter()
            .filter(|i| i.spec.kind == key.kind)
            .collect();
        if imports.is_empty() {
            return Ok(Outcome::Done);
        }

        let result = negotiate(&imports);

        for import in &imports {
            let condition = match result.conflicts.iter().find(|(name, _)| *name == import.metadata.name) {
                Some((_, message)) => Condition::new(conditions::COMPATIBLE, ConditionStatus::False)
                    .with_reason("SchemaConflict")
                    .with_message(message.clone()),
                None => Condition::new(conditions::COMPATIBLE, ConditionStatus::True)
                    .with_reason("Merged"),
            };
            self.set_import_condition(&import.key(), condition).await?;
        }

        let export_key = ObjectKey::cluster_scoped(EXPORTS, &key.workspace, &key.kind);
        let mut exported = self.stores.exports.get(&export_key).await?.is_some();
        if result.conflicts.is_empty() {
            if let Some(schema) = &result.schema {
                self.promote(&key.workspace, &key.kind, schema).await?;
                exported = true;
            }
        }

        self.update_negotiated(key, &result, exported).await?;

        let tracker_key = key.to_string();
        if result.conflicts.is_empty() {
            self.conflicts.lock().await.clear(&tracker_key);
            return Ok(Outcome::Done);
        }
        let attempts = self.conflicts.lock().await.record_failure(&tracker_key);
        let delay = self.conflict_backoff.delay(attempts.saturating_sub(1));
        warn!(
            conflicts = result.conflicts.len(),
            exported,
            attempts,
            retry_in = ?delay,
            "Schema conflict blocks promotion"
        );
        Ok(Outcome::RequeueAfter(delay))
    }

    async fn set_import_condition(
        &self,
        key: &ObjectKey,
        condition: Condition,
    ) -> Result<(), NegotiationError> {
        let condition = &condition;
        retry_on_conflict::<_, NegotiationError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                let Some(mut import) = self.stores.imports.get(key).await? else {
                    return Ok(());
                };
                let before = import.status.clone();
                conditions::set(&mut import.status.conditions, condition.clone());
                if import.status != before {
                    self.stores.imports.update_status(import).await?;
                }
                Ok(())
            },
        )
        .await
    }

    /// Create or update the export and its same-workspace binding.
    async fn promote(
        &self,
        workspace: &str,
        kind: &str,
        schema: &StructuralSchema,
    ) -> Result<(), NegotiationError> {
        let export_key = ObjectKey::cluster_scoped(EXPORTS, workspace, kind);
        let export_key = &export_key;
        let export = retry_on_conflict::<_, NegotiationError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                match self.stores.exports.get(export_key).await? {
                    Some(existing) if existing.spec.schema == *schema => Ok(existing),
                    Some(mut existing) => {
                        existing.spec.schema = schema.clone();
                        info!("Export schema widened");
                        Ok(self.stores.exports.update(existing).await?)
                    }
                    None => {
                        let created = self
                            .stores
                            .exports
                            .create(Export::new(workspace, kind, schema.clone()))
                            .await?;
                        info!("Kind exported");
                        Ok(created)
                    }
                }
            },
        )
        .await?;

        let binding = Binding::new(workspace, &export);
        if self.stores.bindings.get(&binding.key()).await?.is_none() {
            match self.stores.bindings.create(binding).await {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn update_negotiated(
        &self,
        key: &KindKey,
        result: &Negotiation,
        exported: bool,
    ) -> Result<(), NegotiationError> {
        let nr_key = ObjectKey::cluster_scoped(NEGOTIATED_RESOURCES, &key.workspace, &key.kind);
        let nr_key = &nr_key;
        retry_on_conflict::<_, NegotiationError, _, _>(
            &BackoffPolicy::conflict(),
            CONFLICT_ATTEMPTS,
            || async move {
                let mut nr = match self.stores.negotiated.get(nr_key).await? {
                    Some(nr) => nr,
                    None => {
                        self.stores
                            .negotiated
                            .create(NegotiatedResource::new(&key.workspace, &key.kind))
                            .await?
                    }
                };

                if result.conflicts.is_empty() && nr.spec.schema != result.schema {
                    nr.spec.schema = result.schema.clone();
                    nr = self.stores.negotiated.update(nr).await?;
                }

                let before = nr.status.clone();
                nr.status.imports = result.accepted.clone();
                let compatible = match result.conflicts.first() {
                    None => Condition::new(conditions::COMPATIBLE, ConditionStatus::True)
                        .with_reason("AllImportsCompatible"),
                    Some((name, message)) => {
                        Condition::new(conditions::COMPATIBLE, ConditionStatus::False)
                            .with_reason("SchemaConflict")
                            .with_message(format!("{name}: {message}"))
                    }
                };
                conditions::set(&mut nr.status.conditions, compatible);
                let exported = if exported {
                    Condition::new(conditions::EXPORTED, ConditionStatus::True).with_reason(
                        if result.conflicts.is_empty() {
                            "Exported"
                        } else {
                            "PreviousSchemaKept"
                        },
                    )
                } else {
                    Condition::new(conditions::EXPORTED, ConditionStatus::False)
                        .with_reason("BlockedBySchemaConflict")
                };
                conditions::set(&mut nr.status.conditions, exported);

                if nr.status != before {
                    self.stores.negotiated.update_status(nr).await?;
                }
                Ok(())
            },
        )
        .await
    }
}

/// Outcome of merging a kind's imports.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiation {
    /// Union of the accepted imports' schemas.
    pub schema: Option<StructuralSchema>,
    /// Imports merged into `schema`, in name order.
    pub accepted: Vec<String>,
    /// Imports that conflict with the accepted ones, with the reason.
    pub conflicts: Vec<(String, String)>,
}

/// Merge imports in name order. An import conflicting with the union so far
/// is set aside and the rest still merge. Pure.
pub fn negotiate(imports: &[ResourceImport]) -> Negotiation {
    let mut result = Negotiation {
        schema: None,
        accepted: Vec::new(),
        conflicts: Vec::new(),
    };
    for import in imports {
        let name = import.metadata.name.clone();
        let merged = match &result.schema {
            None => Ok(import.spec.schema.clone()),
            Some(acc) => acc.merge(&import.spec.schema),
        };
        match merged {
            Ok(schema) => {
                result.schema = Some(schema);
                result.accepted.push(name);
            }
            Err(conflict) => result.conflicts.push((name, conflict.to_string())),
        }
    }
    result
}
