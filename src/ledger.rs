// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-kind record of what a run created, updated, deleted and had rejected.
//!
//! The comparison stage derives the expected remote count from it
//! (`created - deleted`, refused creates never enter the create wave) and walks each owner's create wave for
//! field-level checks.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;

use crate::record::Record;

#[derive(Debug)]
struct LedgerState<R> {
    created: BTreeMap<i32, Vec<R>>,
    created_ids: HashSet<i64>,
    updated: HashMap<i64, R>,
    deleted: HashSet<i64>,
    ignored: Vec<String>,
}

pub struct WaveLedger<R: Record> {
    state: Mutex<LedgerState<R>>,
}

impl<R: Record> WaveLedger<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                created: BTreeMap::new(),
                created_ids: HashSet::new(),
                updated: HashMap::new(),
                deleted: HashSet::new(),
                ignored: Vec::new(),
            }),
        }
    }

    /// Remember a confirmed create under its owner.
    pub fn record_created(&self, record: &R) {
        let mut state = self.state.lock();
        if let Some(id) = record.id() {
            state.created_ids.insert(id);
        }
        state.created.entry(record.meta().owner_id).or_default().push(record.clone());
    }

    /// Keep the newest applied snapshot per id.
    pub fn record_updated(&self, record: &R) {
        let Some(id) = record.id() else { return };
        let mut state = self.state.lock();
        match state.updated.get(&id) {
            Some(prev) if prev.message_id() >= record.message_id() => {}
            _ => {
                state.updated.insert(id, record.clone());
            }
        }
    }

    pub fn record_deleted(&self, id: i64) {
        let mut state = self.state.lock();
        state.deleted.insert(id);
        state.updated.remove(&id);
    }

    /// A create the remote refused.
    pub fn record_ignored(&self, message_id: &str) {
        self.state.lock().ignored.push(message_id.to_string());
    }

    /// Every record created during the run for `owner_id`.
    #[must_use]
    pub fn create_wave(&self, owner_id: i32) -> Vec<R> {
        self.state.lock().created.get(&owner_id).cloned().unwrap_or_default()
    }

    /// Latest update applied to `id`, if any.
    #[must_use]
    pub fn latest_update(&self, id: i64) -> Option<R> {
        self.state.lock().updated.get(&id).cloned()
    }

    #[must_use]
    pub fn updated_count(&self) -> usize {
        self.state.lock().updated.len()
    }

    #[must_use]
    pub fn owners(&self) -> Vec<i32> {
        self.state.lock().created.keys().copied().collect()
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.state.lock().created.values().map(Vec::len).sum()
    }

    /// Deleted ids that this run had created.
    #[must_use]
    pub fn deleted_count(&self) -> usize {
        let state = self.state.lock();
        state.deleted.iter().filter(|id| state.created_ids.contains(id)).count()
    }

    #[must_use]
    pub fn ignored_count(&self) -> usize {
        self.state.lock().ignored.len()
    }

    #[must_use]
    pub fn was_deleted(&self, id: i64) -> bool {
        self.state.lock().deleted.contains(&id)
    }
}

impl<R: Record> Default for WaveLedger<R> {
    fn default() -> Self {
        Self::new()
    }
}
