// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::record::Record;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Serialization failure or deadlock; the whole transaction may be retried.
    #[error("Transient conflict: {0}")]
    Conflict(String),
    /// Unique index on message id (or primary key) rejected a row.
    #[error("Duplicate key: {0}")]
    Duplicate(String),
    #[error("Failed to decode row: {0}")]
    Decode(String),
}

impl StorageError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Outcome of one update sub-batch transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkUpdate {
    /// Target ids that still existed when the rows were locked
    pub surviving: usize,
    /// Rows the UPDATE actually touched
    pub updated: usize,
}

/// Per-kind replica store.
///
/// `update_chunk` is one transaction: lock the target rows, stage the
/// surviving subset, apply a single joined UPDATE. Callers own retry.
#[async_trait]
pub trait ReplicaStore<R: Record>: Send + Sync {
    /// Append-only bulk insert.
    async fn insert_batch(&self, records: &[R]) -> Result<usize, StorageError>;

    async fn update_chunk(&self, records: &[R]) -> Result<ChunkUpdate, StorageError>;

    /// Delete by set membership. Returns rows removed.
    async fn delete_batch(&self, ids: &[i64]) -> Result<usize, StorageError>;

    async fn get(&self, id: i64) -> Result<Option<R>, StorageError>;

    async fn version(&self, id: i64) -> Result<Option<i32>, StorageError> {
        Ok(self.get(id).await?.map(|r| r.meta().version))
    }

    async fn count(&self) -> Result<u64, StorageError>;
}
