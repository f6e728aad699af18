// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record model for the five mirrored kinds.
//!
//! Every kind shares [`RecordMeta`] (remote id, version, owner, message id,
//! correlation guid) and implements [`Record`], which is all the generic
//! flush/persist/compare machinery needs to know about a kind.
//!
//! ```text
//! ToDoItem            (independent)
//! Asset ──────────▶ AssetTask      (AssetTask.asset_id = Asset.id)
//! Meter ──────────▶ MeterReading   (MeterReading.meter_id = Meter.id)
//! ```
//!
//! Wire names are camelCase, with `clientId` for the owner and `guid` for the
//! correlation guid.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};
use uuid::Uuid;

use crate::error::OracleError;

/// The five record kinds mirrored by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    ToDoItem,
    Asset,
    AssetTask,
    Meter,
    MeterReading,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::ToDoItem,
        RecordKind::Asset,
        RecordKind::AssetTask,
        RecordKind::Meter,
        RecordKind::MeterReading,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToDoItem => "ToDoItem",
            Self::Asset => "Asset",
            Self::AssetTask => "AssetTask",
            Self::Meter => "Meter",
            Self::MeterReading => "MeterReading",
        }
    }

    /// Parent kind a child references by remote id.
    #[must_use]
    pub fn parent(&self) -> Option<RecordKind> {
        match self {
            Self::AssetTask => Some(Self::Asset),
            Self::MeterReading => Some(Self::Meter),
            _ => None,
        }
    }

    #[must_use]
    pub fn child(&self) -> Option<RecordKind> {
        match self {
            Self::Asset => Some(Self::AssetTask),
            Self::Meter => Some(Self::MeterReading),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_parent(&self) -> bool {
        self.child().is_some()
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = OracleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| OracleError::MalformedEvent(format!("unknown entity type '{}'", s)))
    }
}

/// One of the three per-kind write lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Insert,
    Update,
    Delete,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Insert, Lane::Update, Lane::Delete];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata shared by every kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    /// Remote-assigned id, absent until the create confirmation arrives.
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub version: i32,
    #[serde(rename = "clientId", alias = "ownerId", default)]
    pub owner_id: i32,
    #[serde(default)]
    pub message_id: String,
    #[serde(rename = "guid", alias = "correlationGuid", default)]
    pub correlation_guid: Option<Uuid>,
}

impl RecordMeta {
    #[must_use]
    pub fn new(owner_id: i32, message_id: impl Into<String>) -> Self {
        Self {
            id: None,
            version: 0,
            owner_id,
            message_id: message_id.into(),
            correlation_guid: Some(Uuid::new_v4()),
        }
    }
}

/// A field whose local and remote values disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    pub field: &'static str,
    pub local: String,
    pub remote: String,
}

fn diff_field<T: PartialEq + Debug>(out: &mut Vec<FieldDiff>, field: &'static str, local: &T, remote: &T) {
    if local != remote {
        out.push(FieldDiff {
            field,
            local: format!("{:?}", local),
            remote: format!("{:?}", remote),
        });
    }
}

fn meta_diffs(local: &RecordMeta, remote: &RecordMeta) -> Vec<FieldDiff> {
    let mut out = Vec::new();
    diff_field(&mut out, "version", &local.version, &remote.version);
    diff_field(&mut out, "owner_id", &local.owner_id, &remote.owner_id);
    out
}

/// Capability set the generic pipeline needs from a kind.
pub trait Record: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: RecordKind;

    fn meta(&self) -> &RecordMeta;
    fn meta_mut(&mut self) -> &mut RecordMeta;

    fn id(&self) -> Option<i64> {
        self.meta().id
    }

    fn message_id(&self) -> &str {
        &self.meta().message_id
    }

    /// Remote id of the parent record, for child kinds.
    fn parent_id(&self) -> Option<i64> {
        None
    }

    fn set_parent_id(&mut self, _id: i64) {}

    /// Field-level comparison against the remote copy of the same record.
    fn field_diffs(&self, remote: &Self) -> Vec<FieldDiff>;

    /// The mutation an update command applies to this kind.
    fn mutate_for_update(&mut self, message_id: &str);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToDoItem {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_complete: bool,
}

impl Record for ToDoItem {
    const KIND: RecordKind = RecordKind::ToDoItem;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn field_diffs(&self, remote: &Self) -> Vec<FieldDiff> {
        let mut out = meta_diffs(&self.meta, &remote.meta);
        diff_field(&mut out, "name", &self.name, &remote.name);
        diff_field(&mut out, "description", &self.description, &remote.description);
        diff_field(&mut out, "is_complete", &self.is_complete, &remote.is_complete);
        out
    }

    fn mutate_for_update(&mut self, message_id: &str) {
        self.is_complete = !self.is_complete;
        self.description = format!("{}_Updated_{}", self.description, message_id);
        self.meta.message_id = message_id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_msi: bool,
}

impl Record for Asset {
    const KIND: RecordKind = RecordKind::Asset;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn field_diffs(&self, remote: &Self) -> Vec<FieldDiff> {
        let mut out = meta_diffs(&self.meta, &remote.meta);
        diff_field(&mut out, "code", &self.code, &remote.code);
        diff_field(&mut out, "description", &self.description, &remote.description);
        diff_field(&mut out, "is_msi", &self.is_msi, &remote.is_msi);
        out
    }

    fn mutate_for_update(&mut self, message_id: &str) {
        self.is_msi = true;
        self.description = format!("{}_Updated_{}", self.description, message_id);
        self.meta.message_id = message_id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTask {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub asset_id: Option<i64>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_rfs: bool,
}

impl Record for AssetTask {
    const KIND: RecordKind = RecordKind::AssetTask;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn parent_id(&self) -> Option<i64> {
        self.asset_id
    }

    fn set_parent_id(&mut self, id: i64) {
        self.asset_id = Some(id);
    }

    fn field_diffs(&self, remote: &Self) -> Vec<FieldDiff> {
        let mut out = meta_diffs(&self.meta, &remote.meta);
        diff_field(&mut out, "asset_id", &self.asset_id, &remote.asset_id);
        diff_field(&mut out, "code", &self.code, &remote.code);
        diff_field(&mut out, "description", &self.description, &remote.description);
        diff_field(&mut out, "is_rfs", &self.is_rfs, &remote.is_rfs);
        out
    }

    fn mutate_for_update(&mut self, message_id: &str) {
        self.is_rfs = !self.is_rfs;
        self.description = format!("{}_Updated_{}", self.description, message_id);
        self.meta.message_id = message_id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub adr: f64,
}

impl Record for Meter {
    const KIND: RecordKind = RecordKind::Meter;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn field_diffs(&self, remote: &Self) -> Vec<FieldDiff> {
        let mut out = meta_diffs(&self.meta, &remote.meta);
        diff_field(&mut out, "code", &self.code, &remote.code);
        diff_field(&mut out, "description", &self.description, &remote.description);
        diff_field(&mut out, "is_paused", &self.is_paused, &remote.is_paused);
        diff_field(&mut out, "adr", &self.adr, &remote.adr);
        out
    }

    fn mutate_for_update(&mut self, message_id: &str) {
        self.is_paused = !self.is_paused;
        self.description = format!("{}_Updated_{}", self.description, message_id);
        self.meta.message_id = message_id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterReading {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub meter_id: Option<i64>,
    #[serde(default)]
    pub reading: f64,
    #[serde(default)]
    pub reading_on: Option<DateTime<Utc>>,
}

impl Record for MeterReading {
    const KIND: RecordKind = RecordKind::MeterReading;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn parent_id(&self) -> Option<i64> {
        self.meter_id
    }

    fn set_parent_id(&mut self, id: i64) {
        self.meter_id = Some(id);
    }

    fn field_diffs(&self, remote: &Self) -> Vec<FieldDiff> {
        let mut out = meta_diffs(&self.meta, &remote.meta);
        diff_field(&mut out, "meter_id", &self.meter_id, &remote.meter_id);
        diff_field(&mut out, "reading", &self.reading, &remote.reading);
        diff_field(&mut out, "reading_on", &self.reading_on, &remote.reading_on);
        out
    }

    fn mutate_for_update(&mut self, message_id: &str) {
        self.reading += 1.0;
        self.meta.message_id = message_id.to_string();
    }
}

/// Issues message ids as monotonic ULIDs.
///
/// Lexicographic order equals issue order, so "highest message id wins" when
/// collapsing updates means "latest issued wins".
pub struct MessageIdGenerator {
    inner: Mutex<Generator>,
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    pub fn next_id(&self) -> String {
        let mut generator = self.inner.lock();
        // Random-part overflow inside one millisecond: fall back to a fresh ULID.
        let id = generator.generate().unwrap_or_else(|_| Ulid::new());
        id.to_string()
    }
}
