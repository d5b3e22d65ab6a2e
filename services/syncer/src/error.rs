//! Syncer errors.

use kplane_api::TransitionError;
use kplane_reconcile::RetryableError;
use kplane_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The control plane answered with an error.
    #[error("control plane returned {status} {code}: {detail}")]
    ControlPlane {
        status: u16,
        code: String,
        detail: String,
        retryable: bool,
    },

    /// The control plane could not be reached.
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// An intent label holds a transition this syncer may not make.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Local misconfiguration or a malformed object; retrying won't help.
    #[error("{0}")]
    Invalid(String),
}

impl RetryableError for SyncError {
    fn is_transient(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_transient(),
            SyncError::ControlPlane { retryable, status, .. } => *retryable || *status >= 500,
            SyncError::Http(_) => true,
            SyncError::Transition(_) | SyncError::Invalid(_) => false,
        }
    }

    fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Store(e) if e.is_conflict())
    }
}
