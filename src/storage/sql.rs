// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL replica store (SQLite or MySQL via the sqlx `Any` driver).
//!
//! One table per kind, see [`super::columns`] for the layout. Batched updates
//! run as a single transaction per sub-batch:
//!
//! ```text
//! BEGIN
//!   SELECT id FROM t WHERE id IN (...) [FOR UPDATE]    -- lock, find survivors
//!   CREATE TEMPORARY TABLE stage_t AS SELECT * FROM t WHERE 1 = 0
//!   INSERT INTO stage_t VALUES (...), (...)            -- survivors only
//!   UPDATE t ... FROM/JOIN stage_t ON t.id = stage_t.id
//!   DROP stage_t
//! COMMIT
//! ```
//!
//! SQLite has no `FOR UPDATE`; its write lock is taken by the transaction
//! itself and contention shows up as BUSY/LOCKED, which is reported as a
//! transient [`StorageError::Conflict`] just like a MySQL deadlock.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::{Any, AnyPool};

use super::columns::{RowReader, SqlRecord, SqlValue};
use super::traits::{ChunkUpdate, ReplicaStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

// MySQL max_allowed_packet is typically 16MB; keep multi-row statements modest
const CHUNK_SIZE: usize = 500;

type AnyQuery<'q> = sqlx::query::Query<'q, Any, AnyArguments<'q>>;

fn bind_value(query: AnyQuery<'_>, value: SqlValue) -> AnyQuery<'_> {
    match value {
        SqlValue::Int(v) => query.bind(v),
        SqlValue::Float(v) => query.bind(v),
        SqlValue::Text(v) => query.bind(v),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Classify a driver error.
///
/// Serialization failures and deadlocks (SQLSTATE 40001/40P01, MySQL lock
/// wait timeout, SQLite BUSY/LOCKED) are transient; unique violations mean a
/// message id reached the store twice.
pub(crate) fn classify(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StorageError::Duplicate(db.message().to_string());
        }
        let code = db.code().map(|c| c.to_string()).unwrap_or_default();
        let message = db.message().to_ascii_lowercase();
        let transient_code = matches!(
            code.as_str(),
            "40001" | "40P01" | "1213" | "1205" | "5" | "6" | "261" | "262" | "517"
        );
        if transient_code
            || message.contains("deadlock")
            || message.contains("lock wait timeout")
            || message.contains("database is locked")
            || message.contains("database table is locked")
        {
            return StorageError::Conflict(format!("[{}] {}", code, db.message()));
        }
    }
    StorageError::Backend(e.to_string())
}

/// A connected pool plus its dialect, shared by every per-kind replica.
#[derive(Clone)]
pub struct ReplicaDatabase {
    pool: AnyPool,
    is_sqlite: bool,
}

impl ReplicaDatabase {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let db = Self { pool, is_sqlite };
        if is_sqlite {
            db.enable_wal_mode().await?;
        }
        Ok(db)
    }

    /// Enable WAL mode for SQLite so readers don't block the flush writers.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[must_use]
    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    /// Open the replica table for `R`, creating it if needed.
    pub async fn replica<R: SqlRecord>(&self) -> Result<SqlReplica<R>, StorageError> {
        let replica = SqlReplica {
            pool: self.pool.clone(),
            is_sqlite: self.is_sqlite,
            _kind: PhantomData,
        };
        replica.init_schema().await?;
        Ok(replica)
    }
}

pub struct SqlReplica<R> {
    pool: AnyPool,
    is_sqlite: bool,
    _kind: PhantomData<fn() -> R>,
}

impl<R: SqlRecord> SqlReplica<R> {
    fn create_table_sql(&self) -> String {
        let id_type = if self.is_sqlite { "INTEGER PRIMARY KEY" } else { "BIGINT PRIMARY KEY" };
        let int_type = if self.is_sqlite { "INTEGER NOT NULL" } else { "BIGINT NOT NULL" };
        let mut columns = vec![
            format!("id {}", id_type),
            format!("version {}", int_type),
            format!("owner_id {}", int_type),
            "message_id VARCHAR(64) NOT NULL".to_string(),
            "correlation_guid VARCHAR(36)".to_string(),
        ];
        columns.extend(R::COLUMNS.iter().map(|c| format!("{} {}", c.name, c.ty.ddl(self.is_sqlite))));
        columns.push(format!("CONSTRAINT uq_{}_message_id UNIQUE (message_id)", R::TABLE));

        format!("CREATE TABLE IF NOT EXISTS {} ({})", R::TABLE, columns.join(", "))
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = self.create_table_sql();
        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        Ok(())
    }

    fn select_sql(&self) -> String {
        format!("SELECT {} FROM {} WHERE id = ?", R::column_names().join(", "), R::TABLE)
    }

    fn insert_sql(table: &str, rows: usize) -> String {
        let names = R::column_names();
        let row = format!("({})", placeholders(names.len()));
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            table,
            names.join(", "),
            vec![row; rows].join(", ")
        )
    }

    fn stage_table() -> String {
        format!("stage_{}", R::TABLE)
    }

    /// Columns an update rewrites: version, message id and the kind's own fields.
    fn update_columns() -> Vec<&'static str> {
        ["version", "message_id"]
            .into_iter()
            .chain(R::COLUMNS.iter().map(|c| c.name))
            .collect()
    }

    fn update_from_stage_sql(&self) -> String {
        let stage = Self::stage_table();
        let table = R::TABLE;
        if self.is_sqlite {
            let sets: Vec<String> = Self::update_columns()
                .iter()
                .map(|c| format!("{c} = s.{c}"))
                .collect();
            format!(
                "UPDATE {table} SET {} FROM {stage} AS s WHERE {table}.id = s.id",
                sets.join(", ")
            )
        } else {
            let sets: Vec<String> = Self::update_columns()
                .iter()
                .map(|c| format!("t.{c} = s.{c}"))
                .collect();
            format!(
                "UPDATE {table} AS t JOIN {stage} AS s ON t.id = s.id SET {}",
                sets.join(", ")
            )
        }
    }

    fn drop_stage_sql(&self) -> String {
        if self.is_sqlite {
            format!("DROP TABLE IF EXISTS temp.{}", Self::stage_table())
        } else {
            format!("DROP TEMPORARY TABLE IF EXISTS {}", Self::stage_table())
        }
    }

    async fn insert_rows<'c, E>(&self, executor: E, table: &str, chunk: &[&R]) -> Result<u64, StorageError>
    where
        E: sqlx::Executor<'c, Database = Any>,
    {
        let sql = Self::insert_sql(table, chunk.len());
        let mut query = sqlx::query(&sql);
        for record in chunk {
            for value in record.row_values() {
                query = bind_value(query, value);
            }
        }
        let result = query.execute(executor).await.map_err(classify)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl<R: SqlRecord> ReplicaStore<R> for SqlReplica<R> {
    async fn insert_batch(&self, records: &[R]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(classify)?;
        let mut written = 0u64;
        let refs: Vec<&R> = records.iter().collect();
        for chunk in refs.chunks(CHUNK_SIZE) {
            written += self.insert_rows(&mut *tx, R::TABLE, chunk).await?;
        }
        tx.commit().await.map_err(classify)?;

        Ok(written as usize)
    }

    async fn update_chunk(&self, records: &[R]) -> Result<ChunkUpdate, StorageError> {
        let ids: Vec<i64> = records.iter().filter_map(|r| r.id()).collect();
        if ids.is_empty() {
            return Ok(ChunkUpdate::default());
        }

        let mut tx = self.pool.begin().await.map_err(classify)?;

        // ====== Lock target rows, learn which still exist ======
        let lock_sql = format!(
            "SELECT id FROM {} WHERE id IN ({}){}",
            R::TABLE,
            placeholders(ids.len()),
            if self.is_sqlite { "" } else { " FOR UPDATE" }
        );
        let mut lock = sqlx::query(&lock_sql);
        for id in &ids {
            lock = lock.bind(*id);
        }
        let rows = lock.fetch_all(&mut *tx).await.map_err(classify)?;
        let existing: HashSet<i64> = rows
            .iter()
            .map(|row| RowReader::new(row).i64("id"))
            .collect::<Result<_, _>>()?;

        let surviving: Vec<&R> = records
            .iter()
            .filter(|r| r.id().is_some_and(|id| existing.contains(&id)))
            .collect();
        if surviving.is_empty() {
            tx.commit().await.map_err(classify)?;
            return Ok(ChunkUpdate::default());
        }

        // ====== Stage survivors ======
        let stage = Self::stage_table();
        sqlx::query(&self.drop_stage_sql())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        sqlx::query(&format!(
            "CREATE TEMPORARY TABLE {} AS SELECT * FROM {} WHERE 1 = 0",
            stage,
            R::TABLE
        ))
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        for chunk in surviving.chunks(CHUNK_SIZE) {
            self.insert_rows(&mut *tx, &stage, chunk).await?;
        }

        // ====== Apply ======
        let result = sqlx::query(&self.update_from_stage_sql())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        sqlx::query(&self.drop_stage_sql())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;

        Ok(ChunkUpdate {
            surviving: surviving.len(),
            updated: result.rows_affected() as usize,
        })
    }

    async fn delete_batch(&self, ids: &[i64]) -> Result<usize, StorageError> {
        let mut removed = 0u64;
        for chunk in ids.chunks(CHUNK_SIZE) {
            let sql = format!("DELETE FROM {} WHERE id IN ({})", R::TABLE, placeholders(chunk.len()));
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            let result = query.execute(&self.pool).await.map_err(classify)?;
            removed += result.rows_affected();
        }
        Ok(removed as usize)
    }

    async fn get(&self, id: i64) -> Result<Option<R>, StorageError> {
        let sql = self.select_sql();
        let id_for_query = id;
        let row = retry("sql_get", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(id_for_query)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)
        })
        .await?;

        row.map(|row| R::from_row(&RowReader::new(&row))).transpose()
    }

    async fn version(&self, id: i64) -> Result<Option<i32>, StorageError> {
        let sql = format!("SELECT version FROM {} WHERE id = ?", R::TABLE);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;

        row.map(|row| RowReader::new(&row).i32("version")).transpose()
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {}", R::TABLE);
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;

        let count = RowReader::new(&row).i64("cnt")?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Asset, Meter, RecordMeta};
    use tempfile::TempDir;

    async fn temp_db() -> (TempDir, ReplicaDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("replica.db").display());
        let db = ReplicaDatabase::connect(&url).await.unwrap();
        (dir, db)
    }

    fn asset(id: i64, message_id: &str, version: i32) -> Asset {
        Asset {
            meta: RecordMeta {
                id: Some(id),
                version,
                owner_id: 1,
                message_id: message_id.to_string(),
                correlation_guid: Some(uuid::Uuid::new_v4()),
            },
            code: format!("A-{}", id),
            description: "pump".into(),
            is_msi: false,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let (_dir, db) = temp_db().await;
        let store = db.replica::<Asset>().await.unwrap();

        let original = asset(10, "m10", 1);
        store.insert_batch(&[original.clone(), asset(11, "m11", 1)]).await.unwrap();

        let loaded = store.get(10).await.unwrap().unwrap();
        assert_eq!(loaded, original);
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.get(12).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_reported() {
        let (_dir, db) = temp_db().await;
        let store = db.replica::<Asset>().await.unwrap();

        store.insert_batch(&[asset(1, "dup", 1)]).await.unwrap();
        let err = store.insert_batch(&[asset(2, "dup", 1)]).await.unwrap_err();
        assert!(matches!(err, StorageError::Duplicate(_)), "got {:?}", err);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_chunk_via_staging_table() {
        let (_dir, db) = temp_db().await;
        let store = db.replica::<Asset>().await.unwrap();
        store.insert_batch(&[asset(1, "m1", 1), asset(2, "m2", 1)]).await.unwrap();

        let mut changed = asset(1, "m3", 2);
        changed.is_msi = true;
        changed.description = "pump_Updated_m3".into();

        // id 99 was never inserted, so only one row survives the lock step
        let result = store.update_chunk(&[changed, asset(99, "m4", 2)]).await.unwrap();
        assert_eq!(result, ChunkUpdate { surviving: 1, updated: 1 });

        let loaded = store.get(1).await.unwrap().unwrap();
        assert!(loaded.is_msi);
        assert_eq!(loaded.meta.version, 2);
        assert_eq!(loaded.meta.message_id, "m3");
        assert_eq!(store.version(2).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_repeated_updates_reuse_stage_table() {
        let (_dir, db) = temp_db().await;
        let store = db.replica::<Asset>().await.unwrap();
        store.insert_batch(&[asset(1, "m1", 1)]).await.unwrap();

        for v in 2..5 {
            let update = asset(1, &format!("m{}", v), v);
            let result = store.update_chunk(&[update]).await.unwrap();
            assert_eq!(result.updated, 1);
        }
        assert_eq!(store.version(1).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_delete_batch_by_membership() {
        let (_dir, db) = temp_db().await;
        let store = db.replica::<Asset>().await.unwrap();
        store
            .insert_batch(&[asset(1, "m1", 1), asset(2, "m2", 1), asset(3, "m3", 1)])
            .await
            .unwrap();

        let removed = store.delete_batch(&[1, 3, 8]).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.version(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tables_per_kind_share_one_database() {
        let (_dir, db) = temp_db().await;
        let assets = db.replica::<Asset>().await.unwrap();
        let meters = db.replica::<Meter>().await.unwrap();

        assets.insert_batch(&[asset(1, "m1", 1)]).await.unwrap();
        let meter = Meter {
            meta: RecordMeta {
                id: Some(1),
                version: 1,
                owner_id: 1,
                message_id: "m1".into(),
                correlation_guid: None,
            },
            code: "M-1".into(),
            description: String::new(),
            is_paused: true,
            adr: 0.25,
        };
        // same id and message id in a different kind's table is fine
        meters.insert_batch(&[meter.clone()]).await.unwrap();

        assert_eq!(meters.get(1).await.unwrap().unwrap(), meter);
        assert_eq!(assets.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_sql_per_dialect() {
        let sqlite = SqlReplica::<Asset> { pool: lazy_pool(), is_sqlite: true, _kind: PhantomData };
        assert!(sqlite.update_from_stage_sql().contains("FROM stage_asset AS s"));

        let mysql = SqlReplica::<Asset> { pool: lazy_pool(), is_sqlite: false, _kind: PhantomData };
        let sql = mysql.update_from_stage_sql();
        assert!(sql.contains("JOIN stage_asset AS s ON t.id = s.id"));
        assert!(sql.contains("t.is_msi = s.is_msi"));
        assert!(!sql.contains("owner_id"));
    }

    fn lazy_pool() -> AnyPool {
        install_drivers();
        AnyPoolOptions::new().connect_lazy("sqlite::memory:").unwrap()
    }
}
