//! # kplane-id
//!
//! Stable identifiers for the kplane control plane.
//!
//! ## Design Principles
//!
//! - UIDs are system-generated and never reused; names are user-controlled
//! - Every identifier has a canonical string form with strict parsing
//! - Identifiers roundtrip through serde (parse → format → parse)
//! - Target keys are derived, not stored: the same (workspace, name) pair
//!   always yields the same key, so labels survive re-registration
//!
//! ## Formats
//!
//! - Object UIDs: `uid_{ulid}`, e.g. `uid_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - Request IDs: `req_{ulid}`
//! - Target keys: base62 of the SHA-224 digest of `{workspace}{name}`
//! - Workspace names: `:`-separated segments, e.g. `root:org:team`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
