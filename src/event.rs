// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change notifications published by the remote system.
//!
//! Wire shape (JSON):
//!
//! ```json
//! {
//!   "messageId": "01J0Z...",
//!   "clientId": 1,
//!   "sessionId": "run-7",
//!   "entityType": "AssetTask",
//!   "operation": "Create",
//!   "guid": "5b7f0c1e-...",
//!   "entity": { "id": 17, "version": 1, "assetId": 4, ... }
//! }
//! ```
//!
//! A missing `entity` is how the remote reports that it refused the command.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OracleError;
use crate::record::{Lane, Record, RecordKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(alias = "create", alias = "CREATE")]
    Create,
    #[serde(alias = "update", alias = "UPDATE")]
    Update,
    #[serde(alias = "delete", alias = "DELETE")]
    Delete,
}

impl Operation {
    #[must_use]
    pub fn lane(self) -> Lane {
        match self {
            Self::Create => Lane::Insert,
            Self::Update => Lane::Update,
            Self::Delete => Lane::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub message_id: String,
    #[serde(rename = "clientId", alias = "ownerId", default)]
    pub owner_id: i32,
    #[serde(default)]
    pub session_id: String,
    #[serde(rename = "entityType")]
    pub kind: RecordKind,
    pub operation: Operation,
    /// Record snapshot after the operation
    #[serde(default)]
    pub entity: Option<serde_json::Value>,
    #[serde(default)]
    pub entity_id: Option<i64>,
    #[serde(rename = "guid", alias = "correlationGuid", default)]
    pub correlation_guid: Option<Uuid>,
}

impl ChangeEvent {
    pub fn parse(text: &str) -> Result<Self, OracleError> {
        let event: Self = serde_json::from_str(text)
            .map_err(|e| OracleError::MalformedEvent(format!("undecodable event: {}", e)))?;
        if event.message_id.is_empty() {
            return Err(OracleError::MalformedEvent("event without messageId".into()));
        }
        Ok(event)
    }

    #[must_use]
    pub fn lane(&self) -> Lane {
        self.operation.lane()
    }

    #[must_use]
    pub fn has_snapshot(&self) -> bool {
        matches!(self.entity, Some(ref v) if !v.is_null())
    }

    /// Decode the snapshot as `R`, filling metadata the payload left out
    /// from the envelope.
    pub fn snapshot<R: Record>(&self) -> Result<Option<R>, OracleError> {
        let Some(value) = self.entity.as_ref().filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let mut record: R = serde_json::from_value(value.clone()).map_err(|e| {
            OracleError::MalformedEvent(format!("{} snapshot for {}: {}", self.kind, self.message_id, e))
        })?;

        let meta = record.meta_mut();
        if meta.id.is_none() {
            meta.id = self.entity_id;
        }
        if meta.correlation_guid.is_none() {
            meta.correlation_guid = self.correlation_guid;
        }
        if meta.owner_id == 0 {
            meta.owner_id = self.owner_id;
        }
        Ok(Some(record))
    }
}
