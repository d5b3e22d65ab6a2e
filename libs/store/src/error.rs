//! Store error types.

use kplane_reconcile::RetryableError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by a [`crate::Store`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with the same key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The write was based on a stale resource version.
    #[error("conflict on {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Returns true for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Returns true for `AlreadyExists`.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

impl RetryableError for StoreError {
    fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Invalid(_))
    }

    fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
