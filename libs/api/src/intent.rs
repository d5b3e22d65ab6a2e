//! Per-object, per-target sync intent.
//!
//! Every workload object carries one label per execution target it is
//! placed on. The label value is the intent state; a missing label means no
//! intent. The lifecycle is a small finite state machine:
//!
//! ```text
//!            Assign                Release               Confirm
//!  Absent ──────────▶ Sync ──────────────────▶ Removing ──────────▶ Absent
//!                     │ ▲                       │ ▲
//!                     └─┘ Assign                └─┘ Release
//! ```
//!
//! `Assign` is issued by the placement engine, `Release` by the placement
//! engine (target moved, workspace unbound) or the syncer (upstream object
//! deleted), and `Confirm` only by the syncer once the downstream mirror is
//! gone. A `Removing` object can therefore never be re-synced before its old
//! mirror is confirmed absent, and a `Sync` object can never be confirmed
//! away without going through removal first.

use std::collections::BTreeMap;

use kplane_id::TargetKey;
use kplane_store::ObjectMeta;
use thiserror::Error;

use crate::labels::{intent_label, target_of_intent_label};

pub const SYNC: &str = "Sync";
pub const REMOVING: &str = "Removing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentState {
    Absent,
    Sync,
    Removing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentTransition {
    /// A target was assigned.
    Assign,
    /// The object must leave the target.
    Release,
    /// The downstream mirror is confirmed absent.
    Confirm,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transition {transition:?} not allowed from {from:?}")]
pub struct TransitionError {
    pub from: IntentState,
    pub transition: IntentTransition,
}

impl IntentState {
    /// Apply a transition.
    pub fn apply(self, transition: IntentTransition) -> Result<IntentState, TransitionError> {
        use IntentState::*;
        use IntentTransition::*;

        match (self, transition) {
            (Absent, Assign) | (Sync, Assign) => Ok(Sync),
            (Sync, Release) | (Removing, Release) => Ok(Removing),
            (Absent, Release) | (Absent, Confirm) | (Removing, Confirm) => Ok(Absent),
            (from @ Removing, Assign) | (from @ Sync, Confirm) => {
                Err(TransitionError { from, transition })
            }
        }
    }

    /// Label value, `None` for `Absent`.
    pub fn label_value(self) -> Option<&'static str> {
        match self {
            IntentState::Absent => None,
            IntentState::Sync => Some(SYNC),
            IntentState::Removing => Some(REMOVING),
        }
    }

    /// Interpret a label value. Unrecognised values count as no intent.
    pub fn from_label_value(value: Option<&str>) -> Self {
        match value {
            Some(SYNC) => IntentState::Sync,
            Some(REMOVING) => IntentState::Removing,
            _ => IntentState::Absent,
        }
    }
}

/// Current intent of an object for `key`.
pub fn read(meta: &ObjectMeta, key: &TargetKey) -> IntentState {
    IntentState::from_label_value(meta.labels.get(&intent_label(key)).map(String::as_str))
}

/// Apply `transition` to the intent for `key` in place.
///
/// Returns whether the labels changed.
pub fn transition(
    meta: &mut ObjectMeta,
    key: &TargetKey,
    transition: IntentTransition,
) -> Result<bool, TransitionError> {
    let current = read(meta, key);
    let next = current.apply(transition)?;
    if next == current {
        return Ok(false);
    }
    write(&mut meta.labels, key, next);
    Ok(true)
}

fn write(labels: &mut BTreeMap<String, String>, key: &TargetKey, state: IntentState) {
    match state.label_value() {
        Some(value) => {
            labels.insert(intent_label(key), value.to_string());
        }
        None => {
            labels.remove(&intent_label(key));
        }
    }
}

/// Every target the object holds an intent for.
pub fn all(meta: &ObjectMeta) -> Vec<(TargetKey, IntentState)> {
    meta.labels
        .iter()
        .filter_map(|(label, value)| {
            let key = target_of_intent_label(label)?;
            match IntentState::from_label_value(Some(value)) {
                IntentState::Absent => None,
                state => Some((key, state)),
            }
        })
        .collect()
}

/// Whether a label key is an intent label.
pub fn is_intent_label(label: &str) -> bool {
    target_of_intent_label(label).is_some()
}
