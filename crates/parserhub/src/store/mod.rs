// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parser store interface and backends.
//!
//! The store is the single source of truth for parser records. Every process
//! reads from it; only the sync protocol writes to it.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresParserStore;
pub use self::sqlite::SqliteParserStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::error::Result;
use crate::record::{ParserRecord, Visibility};

/// Column list shared by every parser query.
pub(crate) const PARSER_COLUMNS: &str = "identity, provide, storage_keys, disabled, visibility, \
     rate_requests, rate_window_seconds, continuous, code, source, hash, updated_at";

/// Persistence interface used by the cache, runners and sync protocol.
#[async_trait]
pub trait ParserStore: Send + Sync {
    /// Point lookup by identity.
    async fn get(&self, identity: &str) -> Result<Option<ParserRecord>>;

    /// Bulk fetch by identity set. Unknown identities are skipped.
    async fn get_many(&self, identities: &[String]) -> Result<Vec<ParserRecord>>;

    /// Every record reachable from `roots` through `provide` edges, skipping
    /// (and not expanding) identities in `exclude`. Flat and deduplicated.
    async fn fetch_closure(&self, roots: &[String], exclude: &[String])
    -> Result<Vec<ParserRecord>>;

    /// Enabled, non-continuous records of a kind, optionally restricted to `only`.
    async fn list_group(&self, kind: &str, only: Option<&[String]>) -> Result<Vec<ParserRecord>>;

    /// Enabled, continuous records of a kind.
    async fn list_continuous(&self, kind: &str) -> Result<Vec<ParserRecord>>;

    /// Every record.
    async fn list_all(&self) -> Result<Vec<ParserRecord>>;

    /// Records whose hash is not in `known_hashes`.
    async fn list_changed(&self, known_hashes: &[String]) -> Result<Vec<ParserRecord>>;

    /// Insert-or-update keyed by identity, `batch_size` rows per statement,
    /// all in one transaction.
    async fn upsert(&self, records: &[ParserRecord], batch_size: usize) -> Result<()>;

    /// Delete by identity set, returning the identities actually removed.
    async fn delete(&self, identities: &[String]) -> Result<Vec<String>>;
}

/// Row shape shared by both backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ParserRow {
    identity: String,
    provide: Json<Vec<String>>,
    storage_keys: Json<Vec<String>>,
    disabled: bool,
    visibility: String,
    rate_requests: Option<i32>,
    rate_window_seconds: Option<i32>,
    continuous: bool,
    code: String,
    source: Vec<u8>,
    hash: String,
    updated_at: DateTime<Utc>,
}

impl From<ParserRow> for ParserRecord {
    fn from(row: ParserRow) -> Self {
        ParserRecord {
            identity: row.identity,
            provide: row.provide.0,
            storage_keys: row.storage_keys.0,
            disabled: row.disabled,
            visibility: Visibility::from_columns(
                &row.visibility,
                row.rate_requests,
                row.rate_window_seconds,
            ),
            continuous: row.continuous,
            code: row.code,
            source: row.source,
            hash: row.hash,
            updated_at: row.updated_at,
        }
    }
}

/// `kind/` prefix used to select a group.
pub(crate) fn kind_prefix(kind: &str) -> String {
    format!("{}/", kind.trim_end_matches('/'))
}

/// Keep only records named in `only`, when a restriction is given.
pub(crate) fn restrict(records: Vec<ParserRow>, only: Option<&[String]>) -> Vec<ParserRecord> {
    records
        .into_iter()
        .filter(|row| only.is_none_or(|only| only.iter().any(|id| id == &row.identity)))
        .map(ParserRecord::from)
        .collect()
}
