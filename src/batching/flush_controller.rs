// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-kind write lanes with size- and age-triggered flushing.
//!
//! ```text
//!   stage(record, lane) ──▶ [ stage-lock | HybridBatcher ] ──(count)──┐
//!                                                                     ▼
//!   flush timer (every flush_timeout) ──(age >= timeout)──▶ flush(lane, reason)
//!                                                                     │
//!          flush-lock held ─▶ swap buffer ─▶ persist ─▶ acknowledge ──┘
//! ```
//!
//! The stage-lock is a short synchronous lock around the buffer and is never
//! held across an await. The flush-lock serializes persistence per lane, so
//! batches of one lane reach the store in the order they were taken.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::hybrid_batcher::{BatchConfig, FlushReason, HybridBatcher};
use crate::error::{FaultLatch, OracleError};
use crate::record::{Lane, Record};
use crate::storage::engine::BatchPersistenceEngine;
use crate::tracker::CompletionTracker;

/// A record waiting in a lane, with the message id of the event that staged it.
#[derive(Debug, Clone)]
pub struct Staged<R> {
    pub record: R,
    pub message_id: String,
}

/// Result of a flush that persisted something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub lane: Lane,
    pub reason: FlushReason,
    pub count: usize,
}

struct LaneSlot<R> {
    lane: Lane,
    stage: Mutex<HybridBatcher<Staged<R>>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl<R> LaneSlot<R> {
    fn new(lane: Lane, config: BatchConfig) -> Self {
        Self {
            lane,
            stage: Mutex::new(HybridBatcher::new(config)),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }
}

pub struct FlushController<R: Record> {
    lanes: [LaneSlot<R>; 3],
    engine: Arc<BatchPersistenceEngine<R>>,
    tracker: Arc<CompletionTracker>,
    new_data: watch::Sender<u64>,
    flush_timeout: Duration,
}

impl<R: Record> FlushController<R> {
    pub fn new(
        engine: Arc<BatchPersistenceEngine<R>>,
        tracker: Arc<CompletionTracker>,
        batch_size: usize,
        flush_timeout: Duration,
    ) -> Self {
        let config = BatchConfig {
            flush_ms: flush_timeout.as_millis() as u64,
            flush_count: batch_size.max(1),
        };
        let (new_data, _) = watch::channel(0);
        Self {
            lanes: [
                LaneSlot::new(Lane::Insert, config.clone()),
                LaneSlot::new(Lane::Update, config.clone()),
                LaneSlot::new(Lane::Delete, config),
            ],
            engine,
            tracker,
            new_data,
            flush_timeout,
        }
    }

    fn slot(&self, lane: Lane) -> &LaneSlot<R> {
        match lane {
            Lane::Insert => &self.lanes[0],
            Lane::Update => &self.lanes[1],
            Lane::Delete => &self.lanes[2],
        }
    }

    pub fn engine(&self) -> &Arc<BatchPersistenceEngine<R>> {
        &self.engine
    }

    pub fn tracker(&self) -> &Arc<CompletionTracker> {
        &self.tracker
    }

    /// Generation counter bumped after every insert flush.
    pub fn subscribe_new_data(&self) -> watch::Receiver<u64> {
        self.new_data.subscribe()
    }

    #[must_use]
    pub fn pending(&self, lane: Lane) -> usize {
        self.slot(lane).stage.lock().len()
    }

    /// Append to a lane. A full buffer is flushed before returning.
    pub async fn stage(
        &self,
        lane: Lane,
        record: R,
        message_id: impl Into<String>,
    ) -> Result<Option<FlushOutcome>, OracleError> {
        let trigger = self.slot(lane).stage.lock().push(Staged {
            record,
            message_id: message_id.into(),
        });

        match trigger {
            Some(reason) => self.flush(lane, reason).await,
            None => Ok(None),
        }
    }

    /// Flush one lane.
    ///
    /// `Count` and `Time` only take the buffer if that threshold actually
    /// holds (another flush may have emptied it, or it may be too young);
    /// `Manual` and `Shutdown` take whatever is pending.
    pub async fn flush(&self, lane: Lane, reason: FlushReason) -> Result<Option<FlushOutcome>, OracleError> {
        let slot = self.slot(lane);
        let _flush = slot.flush_lock.lock().await;

        let batch = {
            let mut batcher = slot.stage.lock();
            match reason {
                FlushReason::Count | FlushReason::Time => batcher.take_if_ready(),
                FlushReason::Manual | FlushReason::Shutdown => batcher.force_flush_with_reason(reason),
            }
        };
        let Some(batch) = batch else {
            return Ok(None);
        };

        let count = batch.items.len();
        debug!(
            kind = %R::KIND,
            lane = %slot.lane,
            count,
            reason = %batch.reason,
            age_ms = batch.age.as_millis() as u64,
            "Flushing lane"
        );

        let (records, message_ids): (Vec<R>, Vec<String>) =
            batch.items.into_iter().map(|s| (s.record, s.message_id)).unzip();

        if let Err(e) = self.persist(slot.lane, records).await {
            crate::metrics::record_flush_error(R::KIND, slot.lane);
            return Err(e);
        }

        self.tracker.acknowledge(slot.lane, &message_ids)?;
        if slot.lane == Lane::Insert {
            self.new_data.send_modify(|generation| *generation += 1);
        }
        crate::metrics::record_flush(R::KIND, slot.lane, batch.reason, count);

        Ok(Some(FlushOutcome {
            lane: slot.lane,
            reason: batch.reason,
            count,
        }))
    }

    async fn persist(&self, lane: Lane, records: Vec<R>) -> Result<(), OracleError> {
        match lane {
            Lane::Insert => {
                self.engine.batch_insert(&records).await?;
            }
            Lane::Update => {
                self.engine.batch_update(records).await?;
            }
            Lane::Delete => {
                // Nothing to delete for a record the replica never got an id for
                let ids: Vec<i64> = records.iter().filter_map(|r| r.id()).collect();
                if ids.len() < records.len() {
                    debug!(kind = %R::KIND, skipped = records.len() - ids.len(), "Delete entries without id skipped");
                }
                self.engine.batch_delete(&ids).await?;
            }
        }
        Ok(())
    }

    /// Timer pass: flush every lane whose buffer has aged out.
    pub async fn flush_due(&self) -> Result<Vec<FlushOutcome>, OracleError> {
        let mut outcomes = Vec::new();
        for lane in Lane::ALL {
            if self.pending(lane) == 0 {
                continue;
            }
            if let Some(outcome) = self.flush(lane, FlushReason::Time).await? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Drain all three lanes regardless of thresholds.
    pub async fn flush_all(&self, reason: FlushReason) -> Result<Vec<FlushOutcome>, OracleError> {
        let mut outcomes = Vec::new();
        for lane in Lane::ALL {
            if let Some(outcome) = self.flush(lane, reason).await? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Run the flush timer until `stop` flips to true.
    ///
    /// A flush error is latched into `faults` and ends the timer.
    pub fn spawn_flush_timer(
        self: &Arc<Self>,
        faults: Arc<FaultLatch>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.flush_timeout);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = controller.flush_due().await {
                            faults.latch(e);
                            break;
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(kind = %R::KIND, "Flush timer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordKind, RecordMeta, ToDoItem};
    use crate::resilience::retry::RetryConfig;
    use crate::storage::memory::InMemoryReplica;
    use crate::storage::traits::ReplicaStore;

    fn todo(id: i64) -> ToDoItem {
        ToDoItem {
            meta: RecordMeta {
                id: Some(id),
                version: 1,
                owner_id: 1,
                message_id: format!("m{:04}", id),
                correlation_guid: None,
            },
            name: format!("todo {}", id),
            description: String::new(),
            is_complete: false,
        }
    }

    struct Fixture {
        store: Arc<InMemoryReplica<ToDoItem>>,
        tracker: Arc<CompletionTracker>,
        controller: Arc<FlushController<ToDoItem>>,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let store = Arc::new(InMemoryReplica::new());
        let engine = Arc::new(BatchPersistenceEngine::new(store.clone(), batch_size, RetryConfig::test()));
        let tracker = Arc::new(CompletionTracker::new(RecordKind::ToDoItem, true));
        let controller = Arc::new(FlushController::new(
            engine,
            tracker.clone(),
            batch_size,
            Duration::from_secs(5),
        ));
        Fixture { store, tracker, controller }
    }

    async fn stage_inserts(f: &Fixture, ids: std::ops::RangeInclusive<i64>) {
        for id in ids {
            let record = todo(id);
            let message_id = record.meta.message_id.clone();
            f.tracker.add(Lane::Insert, &message_id).unwrap();
            f.controller.stage(Lane::Insert, record, message_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_full_batch_flushes_immediately() {
        let f = fixture(100);

        stage_inserts(&f, 1..=99).await;
        assert_eq!(f.controller.pending(Lane::Insert), 99);
        assert_eq!(f.store.count().await.unwrap(), 0);

        let record = todo(100);
        f.tracker.add(Lane::Insert, "m0100").unwrap();
        let outcome = f.controller.stage(Lane::Insert, record, "m0100").await.unwrap();

        assert_eq!(
            outcome,
            Some(FlushOutcome { lane: Lane::Insert, reason: FlushReason::Count, count: 100 })
        );
        assert_eq!(f.controller.pending(Lane::Insert), 0);
        assert_eq!(f.store.count().await.unwrap(), 100);
        assert_eq!(f.tracker.outstanding(Lane::Insert), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_flush_skips_young_buffer() {
        let f = fixture(100);
        stage_inserts(&f, 1..=1).await;

        tokio::time::advance(Duration::from_secs(1)).await;
        let outcome = f.controller.flush(Lane::Insert, FlushReason::Time).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(f.controller.pending(Lane::Insert), 1);
        assert_eq!(f.tracker.outstanding(Lane::Insert), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_aged_buffer() {
        let f = fixture(100);
        let faults = Arc::new(FaultLatch::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let timer = f.controller.spawn_flush_timer(faults.clone(), stop_rx);

        stage_inserts(&f, 1..=1).await;
        tokio::time::sleep(Duration::from_millis(5_100)).await;

        assert_eq!(f.store.count().await.unwrap(), 1);
        assert_eq!(f.controller.pending(Lane::Insert), 0);
        assert!(!faults.is_set());

        stop_tx.send(true).unwrap();
        timer.await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_flush_bumps_new_data_generation() {
        let f = fixture(100);
        let mut rx = f.controller.subscribe_new_data();
        assert_eq!(*rx.borrow_and_update(), 0);

        stage_inserts(&f, 1..=3).await;
        f.controller.flush_all(FlushReason::Manual).await.unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_lanes_acknowledge_after_persist() {
        let f = fixture(100);
        stage_inserts(&f, 1..=2).await;
        f.controller.flush_all(FlushReason::Manual).await.unwrap();

        let mut changed = todo(1);
        changed.meta.version = 2;
        changed.meta.message_id = "u1".into();
        f.tracker.add(Lane::Update, "u1").unwrap();
        f.controller.stage(Lane::Update, changed, "u1").await.unwrap();

        let mut pending_delete = todo(2);
        pending_delete.meta.id = None;
        f.tracker.add(Lane::Delete, "d0").unwrap();
        f.tracker.add(Lane::Delete, "d2").unwrap();
        f.controller.stage(Lane::Delete, pending_delete, "d0").await.unwrap();
        f.controller.stage(Lane::Delete, todo(2), "d2").await.unwrap();

        assert_eq!(f.tracker.outstanding(Lane::Update), 1);
        let outcomes = f.controller.flush_all(FlushReason::Shutdown).await.unwrap();
        assert_eq!(outcomes.len(), 2);

        assert_eq!(f.store.version(1).await.unwrap(), Some(2));
        assert!(f.store.get(2).await.unwrap().is_none());
        assert_eq!(f.tracker.outstanding(Lane::Update), 0);
        assert_eq!(f.tracker.outstanding(Lane::Delete), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_propagates_and_keeps_outstanding() {
        let f = fixture(100);
        stage_inserts(&f, 1..=1).await;
        f.controller.flush_all(FlushReason::Manual).await.unwrap();

        // same message id again: the unique index rejects it
        let mut again = todo(2);
        again.meta.message_id = "m0001".into();
        f.tracker.add(Lane::Insert, "m0002").unwrap();
        f.controller.stage(Lane::Insert, again, "m0002").await.unwrap();

        let err = f.controller.flush(Lane::Insert, FlushReason::Manual).await.unwrap_err();
        assert!(matches!(err, OracleError::ProtocolViolation { .. }));
        assert_eq!(f.tracker.outstanding(Lane::Insert), 1);
    }
}
