// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::traits::{ChunkUpdate, ReplicaStore, StorageError};
use crate::record::Record;

/// DashMap-backed replica with the same unique-message-id rule as the SQL tables.
///
/// A transaction mutex stands in for row locks: each batch validates fully
/// before mutating, so a rejected batch leaves no partial writes behind.
pub struct InMemoryReplica<R: Record> {
    rows: DashMap<i64, R>,
    message_ids: DashMap<String, i64>,
    txn: Mutex<()>,
}

impl<R: Record> InMemoryReplica<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            message_ids: DashMap::new(),
            txn: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&self) {
        self.rows.clear();
        self.message_ids.clear();
    }
}

impl<R: Record> Default for InMemoryReplica<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> ReplicaStore<R> for InMemoryReplica<R> {
    async fn insert_batch(&self, records: &[R]) -> Result<usize, StorageError> {
        let _txn = self.txn.lock().await;

        let mut batch_ids = HashSet::with_capacity(records.len());
        let mut batch_messages = HashSet::with_capacity(records.len());
        for record in records {
            let id = record.id().ok_or_else(|| {
                StorageError::Backend(format!("{} row without id (message {})", R::KIND, record.message_id()))
            })?;
            if self.rows.contains_key(&id) || !batch_ids.insert(id) {
                return Err(StorageError::Duplicate(format!("{} id {}", R::KIND, id)));
            }
            let message_id = record.message_id();
            if self.message_ids.contains_key(message_id) || !batch_messages.insert(message_id) {
                return Err(StorageError::Duplicate(format!("{} message_id {}", R::KIND, message_id)));
            }
        }

        for record in records {
            if let Some(id) = record.id() {
                self.message_ids.insert(record.message_id().to_string(), id);
                self.rows.insert(id, record.clone());
            }
        }
        Ok(records.len())
    }

    async fn update_chunk(&self, records: &[R]) -> Result<ChunkUpdate, StorageError> {
        let _txn = self.txn.lock().await;

        let surviving: Vec<&R> = records
            .iter()
            .filter(|r| r.id().is_some_and(|id| self.rows.contains_key(&id)))
            .collect();

        for record in &surviving {
            if let Some(owner) = self.message_ids.get(record.message_id()) {
                if Some(*owner.value()) != record.id() {
                    return Err(StorageError::Duplicate(format!(
                        "{} message_id {}",
                        R::KIND,
                        record.message_id()
                    )));
                }
            }
        }

        let mut updated = 0;
        for record in &surviving {
            let Some(id) = record.id() else { continue };
            if let Some(mut row) = self.rows.get_mut(&id) {
                self.message_ids.remove(row.message_id());
                self.message_ids.insert(record.message_id().to_string(), id);
                *row = (*record).clone();
                updated += 1;
            }
        }

        Ok(ChunkUpdate {
            surviving: surviving.len(),
            updated,
        })
    }

    async fn delete_batch(&self, ids: &[i64]) -> Result<usize, StorageError> {
        let _txn = self.txn.lock().await;

        let mut removed = 0;
        for id in ids {
            if let Some((_, row)) = self.rows.remove(id) {
                self.message_ids.remove(row.message_id());
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn get(&self, id: i64) -> Result<Option<R>, StorageError> {
        Ok(self.rows.get(&id).map(|r| r.value().clone()))
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.rows.len() as u64)
    }
}
