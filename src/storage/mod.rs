// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica stores and the batched persistence engine on top of them.
//!
//! - [`traits`]: the [`ReplicaStore`](traits::ReplicaStore) seam and [`StorageError`](traits::StorageError)
//! - [`memory`]: DashMap-backed replica for tests and dry runs
//! - [`sql`]: MySQL/SQLite replica via sqlx `Any`
//! - [`columns`]: per-kind table layout
//! - [`engine`]: insert/update/delete batching with conflict retry

pub mod traits;
pub mod memory;
pub mod sql;
pub mod columns;
pub mod engine;
