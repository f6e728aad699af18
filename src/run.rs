// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One test run: owns every per-kind pipeline and the shared state between
//! the workload driver, the synchronizer and the comparison stage.
//!
//! ```text
//!   Created ──start()──▶ Running ──settle()──▶ Settling ──compare()──▶ Comparing
//!                                                                       │
//!                         TornDown ◀──shutdown()── Finished ◀───────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::barrier::WaveCompletionBarrier;
use crate::batching::flush_controller::FlushController;
use crate::batching::hybrid_batcher::FlushReason;
use crate::config::OracleConfig;
use crate::error::{FaultLatch, OracleError};
use crate::event::ChangeEvent;
use crate::oracle::{compare_all, ComparisonReport, RemoteSystem};
use crate::record::{Asset, AssetTask, Lane, Meter, MeterReading, MessageIdGenerator, Record, RecordKind, ToDoItem};
use crate::registry::{CorrelationResolver, LivePool};
use crate::resilience::retry::RetryConfig;
use crate::storage::columns::SqlRecord;
use crate::storage::engine::BatchPersistenceEngine;
use crate::storage::memory::InMemoryReplica;
use crate::storage::sql::ReplicaDatabase;
use crate::storage::traits::ReplicaStore;
use crate::synchronizer::{KindChannel, KindPipeline, MessageSynchronizer};

/// Run lifecycle state.
///
/// Use [`TestRun::state()`] to check the current state or
/// [`TestRun::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Built, nothing spawned yet
    Created,
    /// Timers and synchronizer running, commands being issued
    Running,
    /// Waiting on the wave barriers
    Settling,
    /// Comparing against the remote system
    Comparing,
    /// Comparison done
    Finished,
    /// Lanes drained and background tasks stopped
    TornDown,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Settling => write!(f, "Settling"),
            Self::Comparing => write!(f, "Comparing"),
            Self::Finished => write!(f, "Finished"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

async fn build_pipeline<R: SqlRecord>(
    config: &OracleConfig,
    db: Option<&ReplicaDatabase>,
    resolver: &Arc<CorrelationResolver>,
    pool: &Arc<LivePool>,
) -> Result<Arc<dyn KindChannel>, OracleError> {
    let store: Arc<dyn ReplicaStore<R>> = match db {
        Some(db) => Arc::new(db.replica::<R>().await.map_err(|e| OracleError::storage(R::KIND, e))?),
        None => Arc::new(InMemoryReplica::<R>::new()),
    };
    let retry = RetryConfig::contention(config.update_retry_attempts, config.update_retry_base());
    let engine = Arc::new(BatchPersistenceEngine::new(store, config.batch_size, retry));
    let tracker = Arc::new(crate::tracker::CompletionTracker::new(R::KIND, config.strict_duplicates));
    let controller = Arc::new(FlushController::new(
        engine,
        tracker,
        config.batch_size,
        config.flush_timeout(),
    ));
    Ok(Arc::new(KindPipeline::new(controller, resolver.clone(), pool.clone())))
}

pub struct TestRun {
    config: OracleConfig,
    state: watch::Sender<RunState>,
    channels: Vec<Arc<dyn KindChannel>>,
    synchronizer: Arc<MessageSynchronizer>,
    barrier: Arc<WaveCompletionBarrier>,
    resolver: Arc<CorrelationResolver>,
    pool: Arc<LivePool>,
    ids: MessageIdGenerator,
    faults: Arc<FaultLatch>,
    stop: watch::Sender<bool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    sync_task: Mutex<Option<JoinHandle<usize>>>,
}

impl TestRun {
    /// Validate `config` and build one pipeline per active kind, backed by
    /// the SQL replica at `sql_url` or in memory when unset.
    #[tracing::instrument(skip(config), fields(session = %config.session_id))]
    pub async fn new(config: OracleConfig) -> Result<Self, OracleError> {
        config.validate()?;

        let db = match config.sql_url.as_deref() {
            Some(url) => {
                info!(url = %url, "Connecting replica database");
                Some(ReplicaDatabase::connect(url).await.map_err(OracleError::Connect)?)
            }
            None => None,
        };

        let resolver = Arc::new(CorrelationResolver::new(config.resolve_recheck()));
        let pool = Arc::new(LivePool::new());

        let mut channels = Vec::new();
        for kind in RecordKind::ALL.into_iter().filter(|k| config.is_active(*k)) {
            let db = db.as_ref();
            let channel = match kind {
                RecordKind::ToDoItem => build_pipeline::<ToDoItem>(&config, db, &resolver, &pool).await?,
                RecordKind::Asset => build_pipeline::<Asset>(&config, db, &resolver, &pool).await?,
                RecordKind::AssetTask => build_pipeline::<AssetTask>(&config, db, &resolver, &pool).await?,
                RecordKind::Meter => build_pipeline::<Meter>(&config, db, &resolver, &pool).await?,
                RecordKind::MeterReading => build_pipeline::<MeterReading>(&config, db, &resolver, &pool).await?,
            };
            channels.push(channel);
        }

        let faults = Arc::new(FaultLatch::new());
        let (stop, stop_rx) = watch::channel(false);
        let barrier = Arc::new(WaveCompletionBarrier::new(
            channels.iter().map(|c| c.tracker().clone()).collect(),
            config.enabled_lanes(),
            config.barrier_poll(),
            config.barrier_stall_timeout(),
            faults.clone(),
            stop_rx,
        ));
        let synchronizer = Arc::new(MessageSynchronizer::new(config.session_id.clone(), channels.clone()));

        let (state, _) = watch::channel(RunState::Created);
        crate::metrics::set_run_state("Created");
        info!(kinds = channels.len(), sql = db.is_some(), "Test run created");

        Ok(Self {
            config,
            state,
            channels,
            synchronizer,
            barrier,
            resolver,
            pool,
            ids: MessageIdGenerator::new(),
            faults,
            stop,
            timers: Mutex::new(Vec::new()),
            sync_task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: RunState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "Run state changed");
            crate::metrics::set_run_state(&next.to_string());
        }
    }

    pub fn synchronizer(&self) -> &Arc<MessageSynchronizer> {
        &self.synchronizer
    }

    pub fn barrier(&self) -> &Arc<WaveCompletionBarrier> {
        &self.barrier
    }

    pub fn faults(&self) -> &Arc<FaultLatch> {
        &self.faults
    }

    /// Spawn every flush timer and the synchronizer consuming `feed`.
    #[tracing::instrument(skip(self, feed))]
    pub fn start(&self, feed: mpsc::Receiver<ChangeEvent>) -> Result<(), OracleError> {
        if self.state() != RunState::Created {
            return Err(OracleError::Config(format!("run already started ({})", self.state())));
        }

        let mut timers = self.timers.lock();
        for channel in &self.channels {
            timers.push(channel.spawn_flush_timer(self.faults.clone(), self.stop.subscribe()));
        }
        drop(timers);

        *self.sync_task.lock() =
            Some(self.synchronizer.spawn(feed, self.faults.clone(), self.stop.subscribe()));

        self.set_state(RunState::Running);
        Ok(())
    }

    fn channel(&self, kind: RecordKind) -> Result<&Arc<dyn KindChannel>, OracleError> {
        self.channels
            .iter()
            .find(|c| c.kind() == kind)
            .ok_or_else(|| OracleError::Config(format!("{} is not active in this run", kind)))
    }

    /// Typed pipeline of an active kind.
    pub fn pipeline<R: Record>(&self) -> Result<Arc<KindPipeline<R>>, OracleError> {
        self.channel(R::KIND)?
            .clone()
            .as_any()
            .downcast::<KindPipeline<R>>()
            .map_err(|_| OracleError::Config(format!("{} pipeline has an unexpected type", R::KIND)))
    }

    /// Allocate a message id for a command and register it as sent.
    pub fn prepare_command(&self, kind: RecordKind, lane: Lane, owner_id: i32) -> Result<String, OracleError> {
        if !self.config.lane_enabled(lane) {
            return Err(OracleError::Config(format!("{} lane is disabled", lane)));
        }
        let channel = self.channel(kind)?;
        let message_id = self.ids.next_id();
        channel.tracker().add(lane, &message_id)?;
        tracing::debug!(kind = %kind, lane = %lane, owner_id, message_id = %message_id, "Command prepared");
        Ok(message_id)
    }

    /// The driver has issued every command of `lane` for every kind.
    pub fn mark_issuance_complete(&self, lane: Lane) {
        for channel in &self.channels {
            channel.tracker().mark_issuance_complete(lane);
        }
    }

    pub fn mark_kind_issuance_complete(&self, kind: RecordKind, lane: Lane) -> Result<(), OracleError> {
        self.channel(kind)?.tracker().mark_issuance_complete(lane);
        Ok(())
    }

    /// Block until the parent created under `guid` has a remote id.
    pub async fn resolve_parent(&self, guid: Uuid) -> i64 {
        self.resolver.wait_for(guid).await
    }

    pub async fn resolve_parent_timeout(&self, guid: Uuid, timeout: Duration) -> Option<i64> {
        self.resolver.wait_for_timeout(guid, timeout).await
    }

    #[must_use]
    pub fn pick_live_id(&self, kind: RecordKind) -> Option<i64> {
        self.pool.pick(kind)
    }

    /// Like [`pick_live_id`](Self::pick_live_id) but no later pick returns it.
    pub fn take_live_id(&self, kind: RecordKind) -> Option<i64> {
        self.pool.take(kind)
    }

    pub async fn get_by_id<R: Record>(&self, id: i64) -> Result<Option<R>, OracleError> {
        self.pipeline::<R>()?.get_by_id(id).await
    }

    pub async fn get_version<R: Record>(&self, id: i64) -> Result<Option<i32>, OracleError> {
        self.pipeline::<R>()?.get_version(id).await
    }

    pub async fn get_count<R: Record>(&self) -> Result<u64, OracleError> {
        self.pipeline::<R>()?.get_count().await
    }

    pub fn get_create_wave<R: Record>(&self, owner_id: i32) -> Result<Vec<R>, OracleError> {
        Ok(self.pipeline::<R>()?.get_create_wave(owner_id))
    }

    /// Wait for the insert wave only.
    pub async fn wait_inserts(&self) -> Result<Duration, OracleError> {
        self.barrier.wait_inserts().await
    }

    /// Wait for every enabled wave to round-trip.
    #[tracing::instrument(skip(self))]
    pub async fn settle(&self) -> Result<(), OracleError> {
        self.set_state(RunState::Settling);
        self.barrier.run().await
    }

    /// Compare every active kind against the remote system.
    #[tracing::instrument(skip(self, remote))]
    pub async fn compare(&self, remote: &dyn RemoteSystem) -> Result<ComparisonReport, OracleError> {
        if let Some(err) = self.faults.get() {
            return Err(err);
        }
        self.set_state(RunState::Comparing);
        let report = compare_all(&self.channels, remote, self.config.delete_enabled).await?;
        self.set_state(RunState::Finished);
        info!(passed = report.passed(), "Comparison finished");
        Ok(report)
    }

    /// Stop background tasks and drain every lane.
    ///
    /// Returns the first error among a latched fault and the final flushes.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), OracleError> {
        self.stop.send_replace(true);

        let sync_task = self.sync_task.lock().take();
        if let Some(task) = sync_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Synchronizer task failed");
            }
        }
        let timers = std::mem::take(&mut *self.timers.lock());
        for timer in timers {
            if let Err(e) = timer.await {
                warn!(error = %e, "Flush timer task failed");
            }
        }

        let mut first_error = self.faults.get();
        for channel in &self.channels {
            if let Err(e) = channel.flush_all(FlushReason::Shutdown).await {
                warn!(kind = %channel.kind(), error = %e, "Final flush failed");
                first_error.get_or_insert(e);
            }
        }

        self.set_state(RunState::TornDown);
        info!("Test run torn down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
