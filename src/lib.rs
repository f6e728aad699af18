// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Consistency Oracle
//!
//! Verifies eventual consistency between a local reference replica and a
//! remote system that reports its state changes asynchronously.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Workload Driver                        │
//! │  • prepare_command() registers a message id as sent        │
//! │  • resolve_parent() blocks child creates on parent ids     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ commands
//!                              ▼
//!                     (remote system under test)
//!                              │ change events
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    MessageSynchronizer                      │
//! │  • Rejects refused / foreign-session events                │
//! │  • Publishes parent correlation ids, live-id pool, ledger  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ stage(lane)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              FlushController (per kind, 3 lanes)            │
//! │  • Count trigger (batch_size) or age trigger (timeout)     │
//! │  • Acknowledges message ids only after persistence         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  BatchPersistenceEngine                     │
//! │  • Serialized inserts, collapsed + retried updates         │
//! │  • MySQL/SQLite or in-memory replica                       │
//! └─────────────────────────────────────────────────────────────┘
//!
//!   CompletionTracker ──▶ WaveCompletionBarrier ──▶ ComparisonOracle
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use consistency_oracle::{OracleConfig, TestRun, Lane, RecordKind};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), consistency_oracle::OracleError> {
//!     let config = OracleConfig {
//!         session_id: "run-7".into(),
//!         sql_url: Some("sqlite:replica.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!     let run = TestRun::new(config).await?;
//!
//!     let (events, feed) = mpsc::channel(1024);
//!     run.start(feed)?;
//!
//!     // issue commands; hand every change event to `events`
//!     let message_id = run.prepare_command(RecordKind::Asset, Lane::Insert, 1)?;
//!     # let _ = (message_id, events);
//!     run.mark_issuance_complete(Lane::Insert);
//!
//!     run.settle().await?;
//!     run.shutdown().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`record`]: record kinds, lanes, metadata
//! - [`storage`]: replica stores and the persistence engine
//! - [`batching`]: hybrid batcher and per-kind flush lanes
//! - [`tracker`]: outstanding / sent / received bookkeeping
//! - [`synchronizer`]: change-event application
//! - [`barrier`]: wave completion
//! - [`oracle`]: local versus remote comparison
//! - [`run`]: the [`TestRun`] owning all of the above

pub mod config;
pub mod error;
pub mod record;
pub mod event;
pub mod storage;
pub mod batching;
pub mod resilience;
pub mod tracker;
pub mod registry;
pub mod ledger;
pub mod synchronizer;
pub mod barrier;
pub mod oracle;
pub mod run;
pub mod metrics;

pub use config::OracleConfig;
pub use error::{FaultLatch, OracleError};
pub use record::{
    Asset, AssetTask, FieldDiff, Lane, MessageIdGenerator, Meter, MeterReading, Record, RecordKind, RecordMeta,
    ToDoItem,
};
pub use event::{ChangeEvent, Operation};
pub use storage::traits::{ReplicaStore, StorageError, ChunkUpdate};
pub use storage::engine::{BatchPersistenceEngine, UpdateReport};
pub use storage::memory::InMemoryReplica;
pub use storage::sql::{ReplicaDatabase, SqlReplica};
pub use batching::hybrid_batcher::{HybridBatcher, BatchConfig, FlushReason, Batch, FlushBatch};
pub use batching::flush_controller::{FlushController, FlushOutcome};
pub use resilience::retry::RetryConfig;
pub use tracker::{CompletionTracker, TrackerStats};
pub use registry::{CorrelationResolver, LivePool};
pub use ledger::WaveLedger;
pub use synchronizer::{ApplyOutcome, KindChannel, KindPipeline, MessageSynchronizer};
pub use barrier::{WaveCompletionBarrier, WavePhase};
pub use oracle::{ComparisonReport, KindReport, RecordMismatch, RemoteSystem};
pub use run::{RunState, TestRun};
pub use metrics::LatencyTimer;
