//! Admission seam for workload writes.
//!
//! Every object create or update arriving through the API is offered to an
//! [`AdmissionGate`] before it is persisted. The control plane itself ships
//! only [`AllowAll`]; quota policy belongs to whoever installs a gate.

use async_trait::async_trait;
use kplane_api::Object;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub operation: Operation,
    pub object: &'a Object,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("admission denied: {reason}")]
pub struct AdmissionDenied {
    pub reason: String,
}

impl AdmissionDenied {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn admit(&self, request: &AdmissionRequest<'_>) -> Result<(), AdmissionDenied>;
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AdmissionGate for AllowAll {
    async fn admit(&self, _request: &AdmissionRequest<'_>) -> Result<(), AdmissionDenied> {
        Ok(())
    }
}
