// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Column mapping between record kinds and SQL tables.
//!
//! Each kind gets one table:
//!
//! ```sql
//! CREATE TABLE asset (
//!   id BIGINT PRIMARY KEY,          -- remote-assigned
//!   version BIGINT NOT NULL,
//!   owner_id BIGINT NOT NULL,
//!   message_id VARCHAR(64) NOT NULL UNIQUE,
//!   correlation_guid VARCHAR(36),
//!   code TEXT, description TEXT, is_msi BIGINT   -- kind-specific
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! Flags are stored as BIGINT 0/1 because `Any` only decodes `bool` from a
//! native boolean column. Text may come back as bytes on MySQL, so every text
//! read tries `String` first and falls back to `Vec<u8>`. Timestamps are
//! RFC 3339 text.

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::Row;
use uuid::Uuid;

use super::traits::StorageError;
use crate::record::{Asset, AssetTask, Meter, MeterReading, Record, RecordMeta, ToDoItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    OptBigInt,
    Double,
    Flag,
    Text,
    OptText,
}

impl ColumnType {
    pub(crate) fn ddl(&self, is_sqlite: bool) -> &'static str {
        match (self, is_sqlite) {
            (Self::BigInt | Self::Flag, true) => "INTEGER NOT NULL DEFAULT 0",
            (Self::BigInt | Self::Flag, false) => "BIGINT NOT NULL DEFAULT 0",
            (Self::OptBigInt, true) => "INTEGER",
            (Self::OptBigInt, false) => "BIGINT",
            (Self::Double, true) => "REAL NOT NULL DEFAULT 0",
            (Self::Double, false) => "DOUBLE NOT NULL DEFAULT 0",
            (Self::Text, _) => "TEXT NOT NULL",
            (Self::OptText, _) => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

/// A bindable column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(Option<i64>),
    Float(f64),
    Text(Option<String>),
}

impl SqlValue {
    fn flag(b: bool) -> Self {
        Self::Int(Some(i64::from(b)))
    }
}

/// Shared metadata columns, in table order.
pub const META_COLUMNS: [&str; 5] = ["id", "version", "owner_id", "message_id", "correlation_guid"];

pub(crate) fn meta_values(meta: &RecordMeta) -> Vec<SqlValue> {
    vec![
        SqlValue::Int(meta.id),
        SqlValue::Int(Some(i64::from(meta.version))),
        SqlValue::Int(Some(i64::from(meta.owner_id))),
        SqlValue::Text(Some(meta.message_id.clone())),
        SqlValue::Text(meta.correlation_guid.map(|g| g.to_string())),
    ]
}

/// Typed accessors over an `AnyRow` with the driver fallbacks applied.
pub struct RowReader<'a> {
    row: &'a AnyRow,
}

impl<'a> RowReader<'a> {
    pub fn new(row: &'a AnyRow) -> Self {
        Self { row }
    }

    pub fn opt_i64(&self, column: &str) -> Result<Option<i64>, StorageError> {
        if let Ok(v) = self.row.try_get::<Option<i64>, _>(column) {
            return Ok(v);
        }
        if let Ok(v) = self.row.try_get::<Option<i32>, _>(column) {
            return Ok(v.map(i64::from));
        }
        self.row
            .try_get::<Option<bool>, _>(column)
            .map(|v| v.map(i64::from))
            .map_err(|e| StorageError::Decode(format!("{}: {}", column, e)))
    }

    pub fn i64(&self, column: &str) -> Result<i64, StorageError> {
        self.opt_i64(column)?
            .ok_or_else(|| StorageError::Decode(format!("{}: unexpected NULL", column)))
    }

    pub fn i32(&self, column: &str) -> Result<i32, StorageError> {
        let v = self.i64(column)?;
        i32::try_from(v).map_err(|_| StorageError::Decode(format!("{}: {} out of range", column, v)))
    }

    pub fn flag(&self, column: &str) -> Result<bool, StorageError> {
        Ok(self.i64(column)? != 0)
    }

    pub fn f64(&self, column: &str) -> Result<f64, StorageError> {
        if let Ok(v) = self.row.try_get::<f64, _>(column) {
            return Ok(v);
        }
        self.row
            .try_get::<f32, _>(column)
            .map(f64::from)
            .map_err(|e| StorageError::Decode(format!("{}: {}", column, e)))
    }

    pub fn opt_text(&self, column: &str) -> Result<Option<String>, StorageError> {
        // Try String first (SQLite TEXT), then bytes (MySQL TEXT via Any)
        if let Ok(v) = self.row.try_get::<Option<String>, _>(column) {
            return Ok(v);
        }
        let bytes = self
            .row
            .try_get::<Option<Vec<u8>>, _>(column)
            .map_err(|e| StorageError::Decode(format!("{}: {}", column, e)))?;
        bytes
            .map(|b| String::from_utf8(b).map_err(|e| StorageError::Decode(format!("{}: {}", column, e))))
            .transpose()
    }

    pub fn text(&self, column: &str) -> Result<String, StorageError> {
        Ok(self.opt_text(column)?.unwrap_or_default())
    }

    pub fn timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.opt_text(column)?
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| StorageError::Decode(format!("{}: {}", column, e)))
            })
            .transpose()
    }

    pub fn meta(&self) -> Result<RecordMeta, StorageError> {
        let correlation_guid = self
            .opt_text("correlation_guid")?
            .map(|s| Uuid::parse_str(&s).map_err(|e| StorageError::Decode(format!("correlation_guid: {}", e))))
            .transpose()?;
        Ok(RecordMeta {
            id: self.opt_i64("id")?,
            version: self.i32("version")?,
            owner_id: self.i32("owner_id")?,
            message_id: self.text("message_id")?,
            correlation_guid,
        })
    }
}

/// Table mapping for a kind.
pub trait SqlRecord: Record {
    const TABLE: &'static str;
    /// Kind-specific columns, after the shared metadata columns.
    const COLUMNS: &'static [Column];

    /// Values for [`Self::COLUMNS`], same order.
    fn values(&self) -> Vec<SqlValue>;

    fn from_row(row: &RowReader<'_>) -> Result<Self, StorageError>;

    /// All column names, metadata first.
    fn column_names() -> Vec<&'static str> {
        META_COLUMNS
            .iter()
            .copied()
            .chain(Self::COLUMNS.iter().map(|c| c.name))
            .collect()
    }

    /// All values, metadata first.
    fn row_values(&self) -> Vec<SqlValue> {
        let mut values = meta_values(self.meta());
        values.extend(self.values());
        values
    }
}

impl SqlRecord for ToDoItem {
    const TABLE: &'static str = "todo_item";
    const COLUMNS: &'static [Column] = &[
        col("name", ColumnType::Text),
        col("description", ColumnType::Text),
        col("is_complete", ColumnType::Flag),
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(Some(self.name.clone())),
            SqlValue::Text(Some(self.description.clone())),
            SqlValue::flag(self.is_complete),
        ]
    }

    fn from_row(row: &RowReader<'_>) -> Result<Self, StorageError> {
        Ok(Self {
            meta: row.meta()?,
            name: row.text("name")?,
            description: row.text("description")?,
            is_complete: row.flag("is_complete")?,
        })
    }
}

impl SqlRecord for Asset {
    const TABLE: &'static str = "asset";
    const COLUMNS: &'static [Column] = &[
        col("code", ColumnType::Text),
        col("description", ColumnType::Text),
        col("is_msi", ColumnType::Flag),
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(Some(self.code.clone())),
            SqlValue::Text(Some(self.description.clone())),
            SqlValue::flag(self.is_msi),
        ]
    }

    fn from_row(row: &RowReader<'_>) -> Result<Self, StorageError> {
        Ok(Self {
            meta: row.meta()?,
            code: row.text("code")?,
            description: row.text("description")?,
            is_msi: row.flag("is_msi")?,
        })
    }
}

impl SqlRecord for AssetTask {
    const TABLE: &'static str = "asset_task";
    const COLUMNS: &'static [Column] = &[
        col("asset_id", ColumnType::OptBigInt),
        col("code", ColumnType::Text),
        col("description", ColumnType::Text),
        col("is_rfs", ColumnType::Flag),
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Int(self.asset_id),
            SqlValue::Text(Some(self.code.clone())),
            SqlValue::Text(Some(self.description.clone())),
            SqlValue::flag(self.is_rfs),
        ]
    }

    fn from_row(row: &RowReader<'_>) -> Result<Self, StorageError> {
        Ok(Self {
            meta: row.meta()?,
            asset_id: row.opt_i64("asset_id")?,
            code: row.text("code")?,
            description: row.text("description")?,
            is_rfs: row.flag("is_rfs")?,
        })
    }
}

impl SqlRecord for Meter {
    const TABLE: &'static str = "meter";
    const COLUMNS: &'static [Column] = &[
        col("code", ColumnType::Text),
        col("description", ColumnType::Text),
        col("is_paused", ColumnType::Flag),
        col("adr", ColumnType::Double),
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(Some(self.code.clone())),
            SqlValue::Text(Some(self.description.clone())),
            SqlValue::flag(self.is_paused),
            SqlValue::Float(self.adr),
        ]
    }

    fn from_row(row: &RowReader<'_>) -> Result<Self, StorageError> {
        Ok(Self {
            meta: row.meta()?,
            code: row.text("code")?,
            description: row.text("description")?,
            is_paused: row.flag("is_paused")?,
            adr: row.f64("adr")?,
        })
    }
}

impl SqlRecord for MeterReading {
    const TABLE: &'static str = "meter_reading";
    const COLUMNS: &'static [Column] = &[
        col("meter_id", ColumnType::OptBigInt),
        col("reading", ColumnType::Double),
        col("reading_on", ColumnType::OptText),
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Int(self.meter_id),
            SqlValue::Float(self.reading),
            SqlValue::Text(self.reading_on.map(|t| t.to_rfc3339())),
        ]
    }

    fn from_row(row: &RowReader<'_>) -> Result<Self, StorageError> {
        Ok(Self {
            meta: row.meta()?,
            meter_id: row.opt_i64("meter_id")?,
            reading: row.f64("reading")?,
            reading_on: row.timestamp("reading_on")?,
        })
    }
}
