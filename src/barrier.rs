// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multi-wave completion barrier.
//!
//! A lane is settled when every active kind has finished issuing commands on
//! it and the aggregate outstanding count for the lane is zero. Waves run in
//! order: inserts first, then every other enabled lane as one final barrier.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{FaultLatch, OracleError};
use crate::record::Lane;
use crate::tracker::CompletionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavePhase {
    /// Insert wave in flight
    Inserting,
    /// Inserts round-tripped; update/delete waves may be issued
    InsertsSettled,
    /// Every wave round-tripped
    ReadyForComparison,
}

impl std::fmt::Display for WavePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inserting => write!(f, "Inserting"),
            Self::InsertsSettled => write!(f, "InsertsSettled"),
            Self::ReadyForComparison => write!(f, "ReadyForComparison"),
        }
    }
}

pub struct WaveCompletionBarrier {
    trackers: Vec<Arc<CompletionTracker>>,
    lanes: Vec<Lane>,
    poll: Duration,
    stall_timeout: Option<Duration>,
    faults: Arc<FaultLatch>,
    cancel: watch::Receiver<bool>,
    phase: watch::Sender<WavePhase>,
}

impl WaveCompletionBarrier {
    /// `lanes` are the enabled lanes; insert is always waited on first.
    pub fn new(
        trackers: Vec<Arc<CompletionTracker>>,
        lanes: Vec<Lane>,
        poll: Duration,
        stall_timeout: Option<Duration>,
        faults: Arc<FaultLatch>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let (phase, _) = watch::channel(WavePhase::Inserting);
        Self {
            trackers,
            lanes,
            poll,
            stall_timeout,
            faults,
            cancel,
            phase,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WavePhase> {
        self.phase.subscribe()
    }

    #[must_use]
    pub fn phase(&self) -> WavePhase {
        *self.phase.borrow()
    }

    /// Aggregate outstanding count for `lane` across all kinds.
    #[must_use]
    pub fn outstanding(&self, lane: Lane) -> usize {
        self.trackers.iter().map(|t| t.outstanding(lane)).sum()
    }

    #[must_use]
    pub fn lane_settled(&self, lane: Lane) -> bool {
        self.trackers.iter().all(|t| t.issuance_complete(lane)) && self.outstanding(lane) == 0
    }

    /// Lanes of the final barrier, in order.
    fn final_lanes(&self) -> Vec<Lane> {
        self.lanes.iter().copied().filter(|l| *l != Lane::Insert).collect()
    }

    pub async fn wait_for_lane(&self, lane: Lane) -> Result<Duration, OracleError> {
        self.wait_for_lanes(&[lane]).await
    }

    /// Poll until every lane in `lanes` is settled.
    pub async fn wait_for_lanes(&self, lanes: &[Lane]) -> Result<Duration, OracleError> {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_outstanding = usize::MAX;
        let mut last_progress = Instant::now();

        loop {
            ticker.tick().await;

            if let Some(err) = self.faults.get() {
                return Err(err);
            }
            if *self.cancel.borrow() {
                return Err(OracleError::Cancelled);
            }

            if lanes.iter().all(|l| self.lane_settled(*l)) {
                let waited = started.elapsed();
                for lane in lanes {
                    crate::metrics::record_barrier_wait(*lane, waited);
                }
                info!(lanes = ?lanes, waited_ms = waited.as_millis() as u64, "Barrier satisfied");
                return Ok(waited);
            }

            let outstanding: usize = lanes.iter().map(|l| self.outstanding(*l)).sum();
            if outstanding != last_outstanding {
                last_outstanding = outstanding;
                last_progress = Instant::now();
            } else if let Some(limit) = self.stall_timeout {
                let stalled = last_progress.elapsed();
                if stalled >= limit {
                    let lane = lanes
                        .iter()
                        .copied()
                        .find(|l| !self.lane_settled(*l))
                        .unwrap_or(Lane::Insert);
                    return Err(OracleError::BarrierStalled {
                        lane,
                        outstanding,
                        waited_ms: stalled.as_millis() as u64,
                    });
                }
            }

            debug!(lanes = ?lanes, outstanding, "Waiting for barrier");
        }
    }

    pub async fn wait_inserts(&self) -> Result<Duration, OracleError> {
        let waited = self.wait_for_lane(Lane::Insert).await?;
        self.phase.send_replace(WavePhase::InsertsSettled);
        Ok(waited)
    }

    /// Run every wave and publish `ReadyForComparison`.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<(), OracleError> {
        if self.phase() == WavePhase::Inserting {
            self.wait_inserts().await?;
        }

        let rest = self.final_lanes();
        if !rest.is_empty() {
            self.wait_for_lanes(&rest).await?;
        }
        self.phase.send_replace(WavePhase::ReadyForComparison);
        info!("Ready for comparison");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;

    struct Fixture {
        assets: Arc<CompletionTracker>,
        tasks: Arc<CompletionTracker>,
        faults: Arc<FaultLatch>,
        cancel: watch::Sender<bool>,
        barrier: Arc<WaveCompletionBarrier>,
    }

    fn fixture(lanes: Vec<Lane>, stall: Option<Duration>) -> Fixture {
        let assets = Arc::new(CompletionTracker::new(RecordKind::Asset, true));
        let tasks = Arc::new(CompletionTracker::new(RecordKind::AssetTask, true));
        let faults = Arc::new(FaultLatch::new());
        let (cancel, cancel_rx) = watch::channel(false);
        let barrier = Arc::new(WaveCompletionBarrier::new(
            vec![assets.clone(), tasks.clone()],
            lanes,
            Duration::from_secs(1),
            stall,
            faults.clone(),
            cancel_rx,
        ));
        Fixture { assets, tasks, faults, cancel, barrier }
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_barrier_needs_issuance_and_zero_outstanding() {
        let f = fixture(vec![Lane::Insert], None);
        f.assets.add(Lane::Insert, "a1").unwrap();

        let waiter = {
            let barrier = f.barrier.clone();
            tokio::spawn(async move { barrier.wait_inserts().await })
        };

        f.assets.mark_issuance_complete(Lane::Insert);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!waiter.is_finished(), "outstanding insert and task issuance pending");

        f.assets.acknowledge(Lane::Insert, &["a1"]).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!waiter.is_finished(), "task issuance still pending");

        f.tasks.mark_issuance_complete(Lane::Insert);
        waiter.await.unwrap().unwrap();
        assert_eq!(f.barrier.phase(), WavePhase::InsertsSettled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_ready_for_comparison() {
        let f = fixture(vec![Lane::Insert, Lane::Update, Lane::Delete], None);
        let mut phases = f.barrier.subscribe();

        for t in [&f.assets, &f.tasks] {
            for lane in Lane::ALL {
                t.mark_issuance_complete(lane);
            }
        }
        f.tasks.add(Lane::Delete, "d1").unwrap();

        let runner = {
            let barrier = f.barrier.clone();
            tokio::spawn(async move { barrier.run().await })
        };

        phases.changed().await.unwrap();
        assert_eq!(*phases.borrow_and_update(), WavePhase::InsertsSettled);

        f.tasks.acknowledge(Lane::Delete, &["d1"]).unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(*phases.borrow_and_update(), WavePhase::ReadyForComparison);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latched_fault_aborts_wait() {
        let f = fixture(vec![Lane::Insert], None);
        f.assets.add(Lane::Insert, "a1").unwrap();
        f.faults.latch(OracleError::Cancelled);

        let err = f.barrier.wait_inserts().await.unwrap_err();
        assert!(matches!(err, OracleError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_checked_between_polls() {
        let f = fixture(vec![Lane::Insert], None);
        f.assets.add(Lane::Insert, "a1").unwrap();

        let waiter = {
            let barrier = f.barrier.clone();
            tokio::spawn(async move { barrier.wait_inserts().await })
        };
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        f.cancel.send(true).unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, OracleError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_timeout_fails_barrier() {
        let f = fixture(vec![Lane::Insert], Some(Duration::from_secs(10)));
        f.assets.mark_issuance_complete(Lane::Insert);
        f.tasks.mark_issuance_complete(Lane::Insert);
        f.tasks.add(Lane::Insert, "t1").unwrap();

        let started = Instant::now();
        let err = f.barrier.wait_inserts().await.unwrap_err();
        assert!(matches!(
            err,
            OracleError::BarrierStalled { lane: Lane::Insert, outstanding: 1, .. }
        ));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
