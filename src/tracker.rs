// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-kind bookkeeping of issued versus round-tripped message ids.
//!
//! ```text
//!   add(lane, id)          acknowledge(lane, ids) / reject(lane, id)
//!  ───────────────▶ outstanding[lane] ───────────────────────────────▶ received
//!        │                                                              ▲
//!        └──────────────────────────▶ sent ─────────────────────────────┘
//! ```
//!
//! A message id may enter `sent` once and `received` once; a second entry in
//! either is a protocol violation. Removal from `outstanding` is idempotent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::OracleError;
use crate::record::{Lane, RecordKind};

fn lane_index(lane: Lane) -> usize {
    match lane {
        Lane::Insert => 0,
        Lane::Update => 1,
        Lane::Delete => 2,
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    outstanding: [HashSet<String>; 3],
    sent: HashSet<String>,
    received: HashSet<String>,
    applied: HashSet<String>,
    rejected: usize,
}

/// Snapshot of a tracker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub outstanding_inserts: usize,
    pub outstanding_updates: usize,
    pub outstanding_deletes: usize,
    pub sent: usize,
    pub received: usize,
    pub rejected: usize,
}

pub struct CompletionTracker {
    kind: RecordKind,
    strict_duplicates: bool,
    state: Mutex<TrackerState>,
    issuance: [AtomicBool; 3],
}

impl CompletionTracker {
    /// `strict_duplicates` makes a redelivered event fatal; when false the
    /// redelivery is logged and skipped (redundant subscriptions).
    #[must_use]
    pub fn new(kind: RecordKind, strict_duplicates: bool) -> Self {
        Self {
            kind,
            strict_duplicates,
            state: Mutex::new(TrackerState::default()),
            issuance: Default::default(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    fn violation(&self, lane: Lane, detail: String) -> OracleError {
        OracleError::ProtocolViolation {
            kind: self.kind,
            lane,
            detail,
        }
    }

    /// Register a command's message id before it is sent.
    pub fn add(&self, lane: Lane, message_id: &str) -> Result<(), OracleError> {
        let mut state = self.state.lock();
        if state.sent.contains(message_id) {
            return Err(self.violation(lane, format!("message id {} already sent", message_id)));
        }
        state.sent.insert(message_id.to_string());
        state.outstanding[lane_index(lane)].insert(message_id.to_string());
        let outstanding = state.outstanding[lane_index(lane)].len();
        drop(state);

        crate::metrics::set_outstanding(self.kind, lane, outstanding);
        Ok(())
    }

    /// Mark flushed message ids as round-tripped.
    ///
    /// Ids not outstanding on this lane are logged and still recorded as
    /// received; a second receipt of any id is a protocol violation.
    pub fn acknowledge<S: AsRef<str>>(&self, lane: Lane, message_ids: &[S]) -> Result<usize, OracleError> {
        let mut state = self.state.lock();
        let idx = lane_index(lane);
        let mut removed = 0;
        let mut missing = Vec::new();

        for id in message_ids {
            let id = id.as_ref();
            if state.outstanding[idx].remove(id) {
                removed += 1;
            } else {
                missing.push(id.to_string());
            }
            if !state.received.insert(id.to_string()) {
                return Err(self.violation(lane, format!("message id {} received twice", id)));
            }
        }
        let outstanding = state.outstanding[idx].len();
        drop(state);

        if !missing.is_empty() {
            debug!(
                kind = %self.kind,
                lane = %lane,
                count = missing.len(),
                ids = ?missing,
                "Acknowledged message ids that were not outstanding"
            );
        }
        crate::metrics::set_outstanding(self.kind, lane, outstanding);
        Ok(removed)
    }

    /// The remote refused the command: clear it without persisting anything.
    pub fn reject(&self, lane: Lane, message_id: &str) -> Result<(), OracleError> {
        let mut state = self.state.lock();
        let idx = lane_index(lane);
        if !state.outstanding[idx].remove(message_id) {
            warn!(kind = %self.kind, lane = %lane, message_id, "Rejected message id was not outstanding");
        }
        if !state.received.insert(message_id.to_string()) {
            return Err(self.violation(lane, format!("message id {} received twice", message_id)));
        }
        state.rejected += 1;
        let outstanding = state.outstanding[idx].len();
        drop(state);

        crate::metrics::record_rejection(self.kind, lane);
        crate::metrics::set_outstanding(self.kind, lane, outstanding);
        Ok(())
    }

    /// Register that an event is about to be applied.
    ///
    /// Returns `Ok(false)` for a tolerated redelivery that must be skipped.
    pub fn begin_apply(&self, lane: Lane, message_id: &str) -> Result<bool, OracleError> {
        let mut state = self.state.lock();
        if state.applied.insert(message_id.to_string()) {
            return Ok(true);
        }
        drop(state);

        if self.strict_duplicates {
            Err(self.violation(lane, format!("message id {} applied twice", message_id)))
        } else {
            warn!(kind = %self.kind, lane = %lane, message_id, "Skipping redelivered event");
            crate::metrics::record_redelivery(self.kind);
            Ok(false)
        }
    }

    pub fn mark_issuance_complete(&self, lane: Lane) {
        self.issuance[lane_index(lane)].store(true, Ordering::Release);
    }

    #[must_use]
    pub fn issuance_complete(&self, lane: Lane) -> bool {
        self.issuance[lane_index(lane)].load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_insert_issuance_completed(&self) -> bool {
        self.issuance_complete(Lane::Insert)
    }

    #[must_use]
    pub fn has_update_issuance_completed(&self) -> bool {
        self.issuance_complete(Lane::Update)
    }

    #[must_use]
    pub fn has_delete_issuance_completed(&self) -> bool {
        self.issuance_complete(Lane::Delete)
    }

    #[must_use]
    pub fn outstanding(&self, lane: Lane) -> usize {
        self.state.lock().outstanding[lane_index(lane)].len()
    }

    #[must_use]
    pub fn is_outstanding(&self, lane: Lane, message_id: &str) -> bool {
        self.state.lock().outstanding[lane_index(lane)].contains(message_id)
    }

    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        let state = self.state.lock();
        TrackerStats {
            outstanding_inserts: state.outstanding[0].len(),
            outstanding_updates: state.outstanding[1].len(),
            outstanding_deletes: state.outstanding[2].len(),
            sent: state.sent.len(),
            received: state.received.len(),
            rejected: state.rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CompletionTracker {
        CompletionTracker::new(RecordKind::Asset, true)
    }

    #[test]
    fn test_add_then_acknowledge_clears_outstanding() {
        let t = tracker();
        t.add(Lane::Insert, "m1").unwrap();
        t.add(Lane::Insert, "m2").unwrap();
        assert_eq!(t.outstanding(Lane::Insert), 2);

        let removed = t.acknowledge(Lane::Insert, &["m1", "m2"]).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(t.outstanding(Lane::Insert), 0);

        let stats = t.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.received, 2);
    }

    #[test]
    fn test_duplicate_add_is_violation() {
        let t = tracker();
        t.add(Lane::Insert, "m1").unwrap();
        let err = t.add(Lane::Insert, "m1").unwrap_err();
        assert!(matches!(err, OracleError::ProtocolViolation { lane: Lane::Insert, .. }));

        // sent set spans lanes
        assert!(t.add(Lane::Update, "m1").is_err());
    }

    #[test]
    fn test_acknowledge_unknown_id_is_tolerated() {
        let t = tracker();
        let removed = t.acknowledge(Lane::Update, &["never-sent"]).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(t.stats().received, 1);
    }

    #[test]
    fn test_double_receipt_is_violation() {
        let t = tracker();
        t.add(Lane::Delete, "d1").unwrap();
        t.acknowledge(Lane::Delete, &["d1"]).unwrap();
        assert!(t.acknowledge(Lane::Delete, &["d1"]).is_err());
    }

    #[test]
    fn test_reject_clears_without_persisting() {
        let t = tracker();
        t.add(Lane::Insert, "m1").unwrap();
        t.reject(Lane::Insert, "m1").unwrap();

        assert_eq!(t.outstanding(Lane::Insert), 0);
        assert_eq!(t.stats().rejected, 1);
        // a late flush acknowledgement for the same id is a double receipt
        assert!(t.acknowledge(Lane::Insert, &["m1"]).is_err());
    }

    #[test]
    fn test_begin_apply_strict_and_tolerant() {
        let strict = tracker();
        assert!(strict.begin_apply(Lane::Insert, "m1").unwrap());
        assert!(strict.begin_apply(Lane::Insert, "m1").is_err());

        let tolerant = CompletionTracker::new(RecordKind::Asset, false);
        assert!(tolerant.begin_apply(Lane::Insert, "m1").unwrap());
        assert!(!tolerant.begin_apply(Lane::Insert, "m1").unwrap());
    }

    #[test]
    fn test_issuance_flags_are_per_lane() {
        let t = tracker();
        assert!(!t.has_insert_issuance_completed());
        t.mark_issuance_complete(Lane::Insert);
        assert!(t.has_insert_issuance_completed());
        assert!(!t.has_update_issuance_completed());
        assert!(!t.has_delete_issuance_completed());
    }
}
