// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared lookup state between the synchronizer and the workload driver.
//!
//! - [`CorrelationResolver`]: `CorrelationGuid -> Id` for parents whose create
//!   confirmation has been applied. Child creation blocks on it. Entries
//!   remember their parent kind since remote ids are only unique per kind.
//! - [`LivePool`]: ids currently alive per kind, for picking update/delete
//!   targets.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::record::RecordKind;

pub struct CorrelationResolver {
    map: DashMap<Uuid, (RecordKind, i64)>,
    published: Notify,
    recheck: Duration,
}

impl CorrelationResolver {
    /// `recheck` bounds how long a waiter sleeps between lookups if it
    /// somehow misses a wakeup.
    #[must_use]
    pub fn new(recheck: Duration) -> Self {
        Self {
            map: DashMap::new(),
            published: Notify::new(),
            recheck,
        }
    }

    /// Publish a parent's remote id and wake every blocked child.
    pub fn publish(&self, kind: RecordKind, guid: Uuid, id: i64) {
        self.map.insert(guid, (kind, id));
        self.published.notify_waiters();
        debug!(kind = %kind, %guid, id, "Correlation published");
    }

    #[must_use]
    pub fn get(&self, guid: &Uuid) -> Option<i64> {
        self.map.get(guid).map(|e| e.value().1)
    }

    pub fn evict(&self, guid: &Uuid) -> Option<i64> {
        self.map.remove(guid).map(|(_, (_, id))| id)
    }

    /// Drop the `kind` mapping that points at `id` (deletes carry no guid).
    /// Other kinds may reuse the same numeric id and are left alone.
    pub fn evict_id(&self, kind: RecordKind, id: i64) {
        self.map.retain(|_, (k, v)| !(*k == kind && *v == id));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Wait until `guid` resolves. No deadline; drop the future to give up.
    pub async fn wait_for(&self, guid: Uuid) -> i64 {
        loop {
            // Register before checking so a publish between the check and
            // the await still wakes us.
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.get(&guid) {
                return id;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.recheck) => {}
            }
        }
    }

    pub async fn wait_for_timeout(&self, guid: Uuid, timeout: Duration) -> Option<i64> {
        tokio::time::timeout(timeout, self.wait_for(guid)).await.ok()
    }
}

/// Ids alive in the remote system, per kind.
#[derive(Default)]
pub struct LivePool {
    ids: Mutex<HashMap<RecordKind, HashSet<i64>>>,
}

impl LivePool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: RecordKind, id: i64) {
        self.ids.lock().entry(kind).or_default().insert(id);
    }

    pub fn remove(&self, kind: RecordKind, id: i64) -> bool {
        self.ids
            .lock()
            .get_mut(&kind)
            .is_some_and(|set| set.remove(&id))
    }

    /// A random live id, left in the pool.
    #[must_use]
    pub fn pick(&self, kind: RecordKind) -> Option<i64> {
        let ids = self.ids.lock();
        ids.get(&kind)?.iter().copied().choose(&mut rand::thread_rng())
    }

    /// A random live id, removed so no other command targets it.
    pub fn take(&self, kind: RecordKind) -> Option<i64> {
        let mut ids = self.ids.lock();
        let set = ids.get_mut(&kind)?;
        let id = set.iter().copied().choose(&mut rand::thread_rng())?;
        set.remove(&id);
        Some(id)
    }

    #[must_use]
    pub fn count(&self, kind: RecordKind) -> usize {
        self.ids.lock().get(&kind).map_or(0, HashSet::len)
    }

    #[must_use]
    pub fn contains(&self, kind: RecordKind, id: i64) -> bool {
        self.ids.lock().get(&kind).is_some_and(|s| s.contains(&id))
    }
}
