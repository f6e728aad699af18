// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batched persistence for one record kind.
//!
//! - **Insert**: one bulk append under a store-wide write lock.
//! - **Update**: collapse same-id records to the highest message id, split
//!   into sub-batches, run each as one store transaction with jittered
//!   retry on serialization/deadlock conflicts.
//! - **Delete**: one set-membership delete.
//!
//! A duplicate key anywhere means an event reached the store twice, which is
//! reported as a protocol violation rather than retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::traits::{ReplicaStore, StorageError};
use crate::error::OracleError;
use crate::record::{Lane, Record};
use crate::resilience::retry::{retry_if, RetryConfig};

/// What a `batch_update` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Records handed in
    pub requested: usize,
    /// Records left after same-id collapsing (and dropping id-less records)
    pub collapsed: usize,
    /// Targets that still existed when locked
    pub surviving: usize,
    /// Rows actually updated
    pub updated: usize,
    /// Transaction retries across all sub-batches
    pub retries: usize,
}

/// Keep one record per id: the one with the highest message id.
///
/// Records without an id are dropped. Output is ordered by id so concurrent
/// transactions lock rows in the same order.
pub fn collapse_updates<R: Record>(records: Vec<R>) -> Vec<R> {
    let mut latest: HashMap<i64, R> = HashMap::with_capacity(records.len());
    for record in records {
        let Some(id) = record.id() else { continue };
        match latest.get(&id) {
            Some(current) if current.message_id() >= record.message_id() => {}
            _ => {
                latest.insert(id, record);
            }
        }
    }
    let mut out: Vec<R> = latest.into_values().collect();
    out.sort_by_key(|r| r.id());
    out
}

pub struct BatchPersistenceEngine<R: Record> {
    store: Arc<dyn ReplicaStore<R>>,
    write_lock: Mutex<()>,
    batch_size: usize,
    retry: RetryConfig,
}

impl<R: Record> BatchPersistenceEngine<R> {
    pub fn new(store: Arc<dyn ReplicaStore<R>>, batch_size: usize, retry: RetryConfig) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            batch_size: batch_size.max(1),
            retry,
        }
    }

    /// Default policy: sub-batches of 100, 3 attempts, 100ms base backoff.
    pub fn with_defaults(store: Arc<dyn ReplicaStore<R>>) -> Self {
        Self::new(store, 100, RetryConfig::contention(3, Duration::from_millis(100)))
    }

    fn map_error(&self, lane: Lane, e: StorageError) -> OracleError {
        match e {
            StorageError::Duplicate(detail) => OracleError::ProtocolViolation {
                kind: R::KIND,
                lane,
                detail: format!("duplicate key in replica store: {}", detail),
            },
            other => OracleError::storage(R::KIND, other),
        }
    }

    pub async fn batch_insert(&self, records: &[R]) -> Result<usize, OracleError> {
        if records.is_empty() {
            return Ok(0);
        }
        let _timer = crate::metrics::LatencyTimer::new(R::KIND, Lane::Insert);
        let _guard = self.write_lock.lock().await;

        let written = self
            .store
            .insert_batch(records)
            .await
            .map_err(|e| self.map_error(Lane::Insert, e))?;
        debug!(kind = %R::KIND, count = written, "Batch inserted");
        Ok(written)
    }

    pub async fn batch_update(&self, records: Vec<R>) -> Result<UpdateReport, OracleError> {
        let requested = records.len();
        let collapsed = collapse_updates(records);
        let mut report = UpdateReport {
            requested,
            collapsed: collapsed.len(),
            ..Default::default()
        };
        if requested > collapsed.len() {
            crate::metrics::record_collapsed_updates(R::KIND, requested - collapsed.len());
        }
        if collapsed.is_empty() {
            return Ok(report);
        }
        let _timer = crate::metrics::LatencyTimer::new(R::KIND, Lane::Update);

        for chunk in collapsed.chunks(self.batch_size) {
            let attempts = AtomicUsize::new(0);
            let operation = format!("{}_batch_update", R::KIND);

            let result = retry_if(
                &operation,
                &self.retry,
                StorageError::is_transient,
                || async {
                    if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                        crate::metrics::record_conflict_retry(R::KIND);
                    }
                    self.store.update_chunk(chunk).await
                },
            )
            .await;

            let made = attempts.load(Ordering::SeqCst);
            report.retries += made.saturating_sub(1);

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(StorageError::Conflict(last)) => {
                    return Err(OracleError::ConflictRetriesExhausted {
                        kind: R::KIND,
                        attempts: made,
                        last,
                    });
                }
                Err(e) => return Err(self.map_error(Lane::Update, e)),
            };

            if outcome.surviving < chunk.len() {
                debug!(
                    kind = %R::KIND,
                    targets = chunk.len(),
                    surviving = outcome.surviving,
                    "Update targets already deleted"
                );
            }
            if outcome.updated != outcome.surviving {
                warn!(
                    kind = %R::KIND,
                    surviving = outcome.surviving,
                    updated = outcome.updated,
                    "Stale update target: rows updated differ from rows locked"
                );
                crate::metrics::record_stale_target(
                    R::KIND,
                    outcome.surviving.abs_diff(outcome.updated),
                );
            }
            report.surviving += outcome.surviving;
            report.updated += outcome.updated;
        }

        debug!(
            kind = %R::KIND,
            requested = report.requested,
            updated = report.updated,
            retries = report.retries,
            "Batch updated"
        );
        Ok(report)
    }

    pub async fn batch_delete(&self, ids: &[i64]) -> Result<usize, OracleError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _timer = crate::metrics::LatencyTimer::new(R::KIND, Lane::Delete);
        let removed = self
            .store
            .delete_batch(ids)
            .await
            .map_err(|e| self.map_error(Lane::Delete, e))?;
        debug!(kind = %R::KIND, requested = ids.len(), removed, "Batch deleted");
        Ok(removed)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<R>, OracleError> {
        self.store.get(id).await.map_err(|e| OracleError::storage(R::KIND, e))
    }

    /// Current version, `None` if the record is not in the replica.
    pub async fn get_version(&self, id: i64) -> Result<Option<i32>, OracleError> {
        self.store.version(id).await.map_err(|e| OracleError::storage(R::KIND, e))
    }

    pub async fn get_count(&self) -> Result<u64, OracleError> {
        self.store.count().await.map_err(|e| OracleError::storage(R::KIND, e))
    }
}
