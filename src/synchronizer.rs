// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Applies change events from the remote system to the replica.
//!
//! ```text
//!   feed (mpsc) ──▶ MessageSynchronizer ──(entityType)──▶ KindChannel
//!                                                            │
//!              session / snapshot check ── no ──▶ tracker.reject, ledger.ignored
//!                                                            │ yes
//!                        resolver / pool / ledger ◀──────────┤
//!                                                            ▼
//!                                           FlushController::stage(lane)
//! ```
//!
//! Tracker acknowledgement is not done here: the flush controller
//! acknowledges a message id only once its record is durable.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batching::flush_controller::{FlushController, FlushOutcome};
use crate::batching::hybrid_batcher::FlushReason;
use crate::error::{FaultLatch, OracleError};
use crate::event::ChangeEvent;
use crate::ledger::WaveLedger;
use crate::oracle::{compare_kind, KindReport, RemoteSystem};
use crate::record::{Lane, Record, RecordKind};
use crate::registry::{CorrelationResolver, LivePool};
use crate::tracker::CompletionTracker;

/// What happened to one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Staged into its lane
    Applied,
    /// Refused by the remote or from another session; bookkeeping cleared
    Rejected,
    /// Redelivery skipped in tolerant mode
    Redelivered,
    /// Kind not active in this run
    Dropped,
}

impl ApplyOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Rejected => "ignored",
            Self::Redelivered => "redelivered",
            Self::Dropped => "dropped",
        }
    }
}

/// Everything the run holds for one record kind.
pub struct KindPipeline<R: Record> {
    controller: Arc<FlushController<R>>,
    ledger: WaveLedger<R>,
    resolver: Arc<CorrelationResolver>,
    pool: Arc<LivePool>,
}

impl<R: Record> KindPipeline<R> {
    pub fn new(
        controller: Arc<FlushController<R>>,
        resolver: Arc<CorrelationResolver>,
        pool: Arc<LivePool>,
    ) -> Self {
        Self {
            controller,
            ledger: WaveLedger::new(),
            resolver,
            pool,
        }
    }

    pub fn controller(&self) -> &Arc<FlushController<R>> {
        &self.controller
    }

    pub fn ledger(&self) -> &WaveLedger<R> {
        &self.ledger
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<R>, OracleError> {
        self.controller.engine().get_by_id(id).await
    }

    pub async fn get_version(&self, id: i64) -> Result<Option<i32>, OracleError> {
        self.controller.engine().get_version(id).await
    }

    pub async fn get_count(&self) -> Result<u64, OracleError> {
        self.controller.engine().get_count().await
    }

    #[must_use]
    pub fn get_create_wave(&self, owner_id: i32) -> Vec<R> {
        self.ledger.create_wave(owner_id)
    }

    /// Apply one event addressed to this kind.
    pub async fn apply_event(&self, event: &ChangeEvent, session_id: &str) -> Result<ApplyOutcome, OracleError> {
        let tracker = self.controller.tracker();
        let lane = event.lane();

        if !tracker.begin_apply(lane, &event.message_id)? {
            return Ok(ApplyOutcome::Redelivered);
        }

        if event.session_id != session_id || !event.has_snapshot() {
            debug!(
                kind = %R::KIND,
                lane = %lane,
                message_id = %event.message_id,
                session = %event.session_id,
                "Remote rejected command"
            );
            tracker.reject(lane, &event.message_id)?;
            if lane == Lane::Insert {
                self.ledger.record_ignored(&event.message_id);
            }
            return Ok(ApplyOutcome::Rejected);
        }

        let mut record: R = event
            .snapshot()?
            .ok_or_else(|| OracleError::MalformedEvent(format!("{} lost its snapshot", event.message_id)))?;
        record.meta_mut().message_id = event.message_id.clone();

        match lane {
            Lane::Insert => self.on_create(&record)?,
            Lane::Update => self.ledger.record_updated(&record),
            Lane::Delete => self.on_delete(&record),
        }

        if let Some(FlushOutcome { count, reason, .. }) =
            self.controller.stage(lane, record, event.message_id.clone()).await?
        {
            debug!(kind = %R::KIND, lane = %lane, count, reason = %reason, "Stage triggered flush");
        }
        Ok(ApplyOutcome::Applied)
    }

    fn on_create(&self, record: &R) -> Result<(), OracleError> {
        let id = record.id().ok_or_else(|| {
            OracleError::MalformedEvent(format!("{} create {} without id", R::KIND, record.message_id()))
        })?;
        if R::KIND.parent().is_some() && record.parent_id().is_none() {
            return Err(OracleError::MalformedEvent(format!(
                "{} create {} without parent id",
                R::KIND,
                record.message_id()
            )));
        }

        if R::KIND.is_parent() {
            if let Some(guid) = record.meta().correlation_guid {
                self.resolver.publish(R::KIND, guid, id);
            }
        }
        self.pool.add(R::KIND, id);
        self.ledger.record_created(record);
        Ok(())
    }

    fn on_delete(&self, record: &R) {
        let Some(id) = record.id() else {
            warn!(kind = %R::KIND, message_id = %record.message_id(), "Delete without id");
            return;
        };
        self.pool.remove(R::KIND, id);
        if R::KIND.is_parent() {
            match record.meta().correlation_guid {
                Some(guid) => {
                    self.resolver.evict(&guid);
                }
                None => self.resolver.evict_id(R::KIND, id),
            }
        }
        self.ledger.record_deleted(id);
    }
}

/// Kind-erased view of a [`KindPipeline`].
#[async_trait]
pub trait KindChannel: Send + Sync {
    fn kind(&self) -> RecordKind;

    fn tracker(&self) -> &Arc<CompletionTracker>;

    async fn apply(&self, event: &ChangeEvent, session_id: &str) -> Result<ApplyOutcome, OracleError>;

    async fn flush_all(&self, reason: FlushReason) -> Result<Vec<FlushOutcome>, OracleError>;

    fn spawn_flush_timer(&self, faults: Arc<FaultLatch>, stop: watch::Receiver<bool>) -> JoinHandle<()>;

    async fn local_count(&self) -> Result<u64, OracleError>;

    async fn compare(&self, remote: &dyn RemoteSystem, deletes_enabled: bool) -> Result<KindReport, OracleError>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<R: Record> KindChannel for KindPipeline<R> {
    fn kind(&self) -> RecordKind {
        R::KIND
    }

    fn tracker(&self) -> &Arc<CompletionTracker> {
        self.controller.tracker()
    }

    async fn apply(&self, event: &ChangeEvent, session_id: &str) -> Result<ApplyOutcome, OracleError> {
        self.apply_event(event, session_id).await
    }

    async fn flush_all(&self, reason: FlushReason) -> Result<Vec<FlushOutcome>, OracleError> {
        self.controller.flush_all(reason).await
    }

    fn spawn_flush_timer(&self, faults: Arc<FaultLatch>, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        self.controller.spawn_flush_timer(faults, stop)
    }

    async fn local_count(&self) -> Result<u64, OracleError> {
        self.get_count().await
    }

    async fn compare(&self, remote: &dyn RemoteSystem, deletes_enabled: bool) -> Result<KindReport, OracleError> {
        compare_kind(self, remote, deletes_enabled).await
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Routes events to the pipeline of their kind.
pub struct MessageSynchronizer {
    session_id: String,
    channels: HashMap<RecordKind, Arc<dyn KindChannel>>,
}

impl MessageSynchronizer {
    pub fn new(session_id: impl Into<String>, channels: Vec<Arc<dyn KindChannel>>) -> Self {
        Self {
            session_id: session_id.into(),
            channels: channels.into_iter().map(|c| (c.kind(), c)).collect(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome, OracleError> {
        let lane = event.lane();
        let Some(channel) = self.channels.get(&event.kind) else {
            debug!(kind = %event.kind, message_id = %event.message_id, "Event for inactive kind dropped");
            crate::metrics::record_event(event.kind, lane, ApplyOutcome::Dropped.as_str());
            return Ok(ApplyOutcome::Dropped);
        };

        let outcome = channel.apply(event, &self.session_id).await?;
        crate::metrics::record_event(event.kind, lane, outcome.as_str());
        Ok(outcome)
    }

    pub async fn apply_json(&self, text: &str) -> Result<ApplyOutcome, OracleError> {
        let event = ChangeEvent::parse(text)?;
        self.apply(&event).await
    }

    /// Drain `feed` until it closes or `stop` flips to true.
    ///
    /// The first error is latched into `faults` and ends the loop. Returns
    /// the number of events handled.
    #[tracing::instrument(skip_all, fields(session = %self.session_id))]
    pub async fn run(
        &self,
        mut feed: mpsc::Receiver<ChangeEvent>,
        faults: Arc<FaultLatch>,
        mut stop: watch::Receiver<bool>,
    ) -> usize {
        let mut handled = 0usize;
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                next = feed.recv() => {
                    let Some(event) = next else { break };
                    if let Err(e) = self.apply(&event).await {
                        faults.latch(e);
                        break;
                    }
                    handled += 1;
                }
            }
        }
        info!(handled, "Synchronizer stopped");
        handled
    }

    pub fn spawn(
        self: &Arc<Self>,
        feed: mpsc::Receiver<ChangeEvent>,
        faults: Arc<FaultLatch>,
        stop: watch::Receiver<bool>,
    ) -> JoinHandle<usize> {
        let sync = Arc::clone(self);
        tokio::spawn(async move { sync.run(feed, faults, stop).await })
    }
}
