// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local versus remote comparison once every wave has settled.
//!
//! Per kind the remote count is checked first. With deletes enabled the
//! expected count is derived from the ledger:
//!
//! ```text
//!   expected = confirmed creates - deleted
//! ```
//!
//! Refused creates never reach the ledger's create wave, so they drop out
//! without a separate term. Without deletes the expected count is the local
//! replica count. Then every record of every owner's create wave is fetched
//! from both sides and compared field by field. A record missing on either
//! side is skipped, so deleting a parent never breaks the comparison of its
//! children. A replica row whose version differs from the newest update
//! event applied to it is reported as a stale update.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::OracleError;
use crate::record::{FieldDiff, Record, RecordKind};
use crate::synchronizer::{KindChannel, KindPipeline};

/// Read access to the system under test.
#[async_trait]
pub trait RemoteSystem: Send + Sync {
    async fn count(&self, kind: RecordKind) -> Result<u64, OracleError>;

    /// JSON snapshot of one record, `None` if the remote no longer has it.
    async fn get(&self, kind: RecordKind, id: i64) -> Result<Option<serde_json::Value>, OracleError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMismatch {
    pub id: i64,
    pub owner_id: i32,
    pub diffs: Vec<FieldDiff>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindReport {
    pub kind: RecordKind,
    pub expected_count: u64,
    pub remote_count: u64,
    pub local_count: u64,
    /// Records compared field by field
    pub checked: usize,
    /// Records missing locally or remotely
    pub skipped: usize,
    pub mismatches: Vec<RecordMismatch>,
    /// Ids whose replica row disagrees with the newest applied update
    pub stale_updates: Vec<i64>,
}

impl KindReport {
    #[must_use]
    pub fn count_matches(&self) -> bool {
        self.expected_count == self.remote_count
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.count_matches() && self.mismatches.is_empty() && self.stale_updates.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparisonReport {
    pub kinds: Vec<KindReport>,
}

impl ComparisonReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.kinds.iter().all(KindReport::passed)
    }

    #[must_use]
    pub fn kind(&self, kind: RecordKind) -> Option<&KindReport> {
        self.kinds.iter().find(|r| r.kind == kind)
    }
}

pub(crate) async fn compare_kind<R: Record>(
    pipeline: &KindPipeline<R>,
    remote: &dyn RemoteSystem,
    deletes_enabled: bool,
) -> Result<KindReport, OracleError> {
    let ledger = pipeline.ledger();
    let local_count = pipeline.get_count().await?;
    let remote_count = remote.count(R::KIND).await?;

    let expected_count = if deletes_enabled {
        ledger.created_count().saturating_sub(ledger.deleted_count()) as u64
    } else {
        local_count
    };

    let mut report = KindReport {
        kind: R::KIND,
        expected_count,
        remote_count,
        local_count,
        checked: 0,
        skipped: 0,
        mismatches: Vec::new(),
        stale_updates: Vec::new(),
    };
    if !report.count_matches() {
        warn!(kind = %R::KIND, expected = expected_count, remote = remote_count, "Remote count differs");
    }

    for owner_id in ledger.owners() {
        for created in ledger.create_wave(owner_id) {
            let Some(id) = created.id() else {
                report.skipped += 1;
                continue;
            };
            let Some(local) = pipeline.get_by_id(id).await? else {
                report.skipped += 1;
                continue;
            };
            if let Some(latest) = ledger.latest_update(id) {
                if latest.meta().version != local.meta().version {
                    warn!(
                        kind = %R::KIND,
                        id,
                        replica = local.meta().version,
                        applied = latest.meta().version,
                        "Replica row lags the newest applied update"
                    );
                    report.stale_updates.push(id);
                }
            }
            let Some(value) = remote.get(R::KIND, id).await? else {
                report.skipped += 1;
                continue;
            };
            let remote_record: R = serde_json::from_value(value).map_err(|e| {
                OracleError::MalformedEvent(format!("remote {} {}: {}", R::KIND, id, e))
            })?;

            report.checked += 1;
            let diffs = local.field_diffs(&remote_record);
            if !diffs.is_empty() {
                warn!(kind = %R::KIND, id, owner_id, fields = diffs.len(), "Record differs from remote");
                report.mismatches.push(RecordMismatch { id, owner_id, diffs });
            }
        }
    }

    crate::metrics::record_comparison(R::KIND, report.passed(), report.mismatches.len());
    info!(
        kind = %R::KIND,
        expected = report.expected_count,
        remote = report.remote_count,
        checked = report.checked,
        skipped = report.skipped,
        updated = ledger.updated_count(),
        stale = report.stale_updates.len(),
        mismatches = report.mismatches.len(),
        "Kind compared"
    );
    Ok(report)
}

/// Compare every kind in order.
pub async fn compare_all<'a, I>(
    channels: I,
    remote: &dyn RemoteSystem,
    deletes_enabled: bool,
) -> Result<ComparisonReport, OracleError>
where
    I: IntoIterator<Item = &'a std::sync::Arc<dyn KindChannel>>,
{
    let mut report = ComparisonReport::default();
    for channel in channels {
        report.kinds.push(channel.compare(remote, deletes_enabled).await?);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching::flush_controller::FlushController;
    use crate::batching::hybrid_batcher::FlushReason;
    use crate::record::{Lane, Meter, RecordMeta};
    use crate::registry::{CorrelationResolver, LivePool};
    use crate::storage::engine::BatchPersistenceEngine;
    use crate::storage::memory::InMemoryReplica;
    use crate::tracker::CompletionTracker;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    struct FakeRemote {
        meters: HashMap<i64, Meter>,
    }

    #[async_trait]
    impl RemoteSystem for FakeRemote {
        async fn count(&self, _kind: RecordKind) -> Result<u64, OracleError> {
            Ok(self.meters.len() as u64)
        }

        async fn get(&self, _kind: RecordKind, id: i64) -> Result<Option<serde_json::Value>, OracleError> {
            Ok(self.meters.get(&id).map(|m| serde_json::to_value(m).unwrap()))
        }
    }

    fn meter(id: i64) -> Meter {
        let mut meta = RecordMeta::new(1, format!("m{}", id));
        meta.id = Some(id);
        meta.version = 1;
        Meter {
            meta,
            code: format!("M-{}", id),
            description: "meter".into(),
            is_paused: false,
            adr: 1.5,
        }
    }

    async fn pipeline_with(meters: &[Meter]) -> KindPipeline<Meter> {
        let store = Arc::new(InMemoryReplica::new());
        let engine = Arc::new(BatchPersistenceEngine::with_defaults(store));
        let tracker = Arc::new(CompletionTracker::new(RecordKind::Meter, true));
        let controller = Arc::new(FlushController::new(engine, tracker, 100, Duration::from_secs(5)));
        let pipeline = KindPipeline::new(
            controller.clone(),
            Arc::new(CorrelationResolver::new(Duration::from_secs(1))),
            Arc::new(LivePool::new()),
        );
        for m in meters {
            pipeline.ledger().record_created(m);
            controller.stage(Lane::Insert, m.clone(), m.meta.message_id.clone()).await.unwrap();
        }
        controller.flush_all(FlushReason::Manual).await.unwrap();
        pipeline
    }

    #[tokio::test]
    async fn test_matching_replica_passes() {
        let meters = vec![meter(1), meter(2)];
        let pipeline = pipeline_with(&meters).await;
        let remote = FakeRemote { meters: meters.iter().map(|m| (m.meta.id.unwrap(), m.clone())).collect() };

        let report = compare_kind(&pipeline, &remote, true).await.unwrap();
        assert_eq!(report.expected_count, 2);
        assert_eq!(report.checked, 2);
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_field_mismatch_is_reported() {
        let meters = vec![meter(1)];
        let pipeline = pipeline_with(&meters).await;
        let mut drifted = meter(1);
        drifted.adr = 9.0;
        let remote = FakeRemote { meters: HashMap::from([(1, drifted)]) };

        let report = compare_kind(&pipeline, &remote, false).await.unwrap();
        assert!(report.count_matches());
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].diffs[0].field, "adr");
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn test_missing_remote_record_is_skipped() {
        let meters = vec![meter(1), meter(2)];
        let pipeline = pipeline_with(&meters).await;
        pipeline.ledger().record_deleted(2);
        let remote = FakeRemote { meters: HashMap::from([(1, meter(1))]) };

        let report = compare_kind(&pipeline, &remote, true).await.unwrap();
        assert_eq!(report.expected_count, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_replica_behind_latest_update_is_stale() {
        let pipeline = pipeline_with(&[meter(1), meter(2)]).await;
        let mut updated = meter(1);
        updated.meta.version = 2;
        updated.meta.message_id = "u1".into();
        pipeline.ledger().record_updated(&updated);
        let remote = FakeRemote { meters: HashMap::from([(1, meter(1)), (2, meter(2))]) };

        let report = compare_kind(&pipeline, &remote, true).await.unwrap();
        assert!(report.mismatches.is_empty());
        assert_eq!(report.stale_updates, vec![1]);
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn test_applied_update_in_replica_passes() {
        let pipeline = pipeline_with(&[meter(1)]).await;
        let mut updated = meter(1);
        updated.meta.version = 2;
        updated.meta.message_id = "u1".into();
        pipeline.ledger().record_updated(&updated);
        let controller = pipeline.controller();
        controller.stage(Lane::Update, updated.clone(), "u1").await.unwrap();
        controller.flush_all(FlushReason::Manual).await.unwrap();
        let remote = FakeRemote { meters: HashMap::from([(1, updated)]) };

        let report = compare_kind(&pipeline, &remote, true).await.unwrap();
        assert!(report.stale_updates.is_empty());
        assert!(report.passed(), "{:?}", report);
    }

    #[tokio::test]
    async fn test_ignored_creates_do_not_count() {
        let pipeline = pipeline_with(&[meter(1)]).await;
        pipeline.ledger().record_ignored("m-refused");
        let remote = FakeRemote { meters: HashMap::from([(1, meter(1))]) };

        let report = compare_kind(&pipeline, &remote, true).await.unwrap();
        assert_eq!(report.expected_count, 1);
        assert!(report.passed());
    }
}
