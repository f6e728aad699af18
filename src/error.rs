// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Run-level error taxonomy.
//!
//! Storage backends report [`StorageError`](crate::storage::traits::StorageError);
//! everything above the store speaks [`OracleError`]. A protocol violation or an
//! exhausted conflict budget means the run can no longer be trusted, so those
//! are latched into the run's [`FaultLatch`] and surfaced by the barrier.

use parking_lot::Mutex;
use thiserror::Error;

use crate::record::{Lane, RecordKind};
use crate::storage::traits::StorageError;

#[derive(Error, Debug, Clone)]
pub enum OracleError {
    /// The same message id was registered or applied twice.
    #[error("Protocol violation on {kind} {lane} lane: {detail}")]
    ProtocolViolation {
        kind: RecordKind,
        lane: Lane,
        detail: String,
    },

    /// A batched update kept hitting serialization/deadlock conflicts.
    #[error("Update of {kind} gave up after {attempts} conflicting attempts: {last}")]
    ConflictRetriesExhausted {
        kind: RecordKind,
        attempts: usize,
        last: String,
    },

    #[error("Storage failure for {kind}: {source}")]
    Storage {
        kind: RecordKind,
        #[source]
        source: StorageError,
    },

    #[error("Replica unavailable: {0}")]
    Connect(#[source] StorageError),

    #[error("Malformed change event: {0}")]
    MalformedEvent(String),

    #[error("Barrier for {lane} lane stalled with {outstanding} outstanding after {waited_ms}ms")]
    BarrierStalled {
        lane: Lane,
        outstanding: usize,
        waited_ms: u64,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl OracleError {
    pub fn storage(kind: RecordKind, source: StorageError) -> Self {
        Self::Storage { kind, source }
    }

    /// Whether this error ends the run (everything except cancellation).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// First-error-wins slot shared by background tasks of a run.
///
/// Timer flushes and the synchronizer loop have no caller to return an error
/// to, so they latch it here and the barrier picks it up on its next poll.
#[derive(Debug, Default)]
pub struct FaultLatch {
    slot: Mutex<Option<OracleError>>,
}

impl FaultLatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` unless an earlier fault is already latched.
    pub fn latch(&self, err: OracleError) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            tracing::error!(error = %err, "Run fault latched");
            *slot = Some(err);
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<OracleError> {
        self.slot.lock().clone()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_keeps_first_error() {
        let latch = FaultLatch::new();
        assert!(!latch.is_set());

        latch.latch(OracleError::MalformedEvent("first".into()));
        latch.latch(OracleError::Cancelled);

        match latch.get() {
            Some(OracleError::MalformedEvent(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected latch content: {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_is_not_fatal() {
        assert!(!OracleError::Cancelled.is_fatal());
        assert!(OracleError::Config("bad".into()).is_fatal());
    }

    #[test]
    fn test_display_names_kind_and_lane() {
        let err = OracleError::ProtocolViolation {
            kind: RecordKind::Asset,
            lane: Lane::Insert,
            detail: "message id 01H already sent".into(),
        };
        let text = err.to_string();
        assert!(text.contains("Asset"));
        assert!(text.contains("insert"));
    }
}
