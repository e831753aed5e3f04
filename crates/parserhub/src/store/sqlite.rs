// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed parser store.
//!
//! Same semantics as the PostgreSQL store; identity sets are passed as JSON
//! arrays and expanded with `json_each`.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::{Error, Result};
use crate::migrations;
use crate::record::ParserRecord;

use super::{PARSER_COLUMNS, ParserRow, ParserStore, kind_prefix, restrict};

/// SQLite-backed parser store.
#[derive(Clone)]
pub struct SqliteParserStore {
    pool: SqlitePool,
}

impl SqliteParserStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Fresh in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }
}

fn json_ids(identities: &[String]) -> Result<String> {
    Ok(serde_json::to_string(identities)?)
}

#[async_trait]
impl ParserStore for SqliteParserStore {
    async fn get(&self, identity: &str) -> Result<Option<ParserRecord>> {
        let sql = format!("SELECT {PARSER_COLUMNS} FROM parsers WHERE identity = ?");
        let row: Option<ParserRow> = sqlx::query_as(&sql)
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ParserRecord::from))
    }

    async fn get_many(&self, identities: &[String]) -> Result<Vec<ParserRecord>> {
        if identities.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {PARSER_COLUMNS} FROM parsers \
             WHERE identity IN (SELECT value FROM json_each(?)) ORDER BY identity"
        );
        let rows: Vec<ParserRow> = sqlx::query_as(&sql)
            .bind(json_ids(identities)?)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ParserRecord::from).collect())
    }

    async fn fetch_closure(
        &self,
        roots: &[String],
        exclude: &[String],
    ) -> Result<Vec<ParserRecord>> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            WITH RECURSIVE closure(identity) AS (
                SELECT value FROM json_each(?1)
                UNION
                SELECT dep.value
                FROM parsers p
                JOIN closure c ON p.identity = c.identity
                JOIN json_each(p.provide) dep
                WHERE c.identity NOT IN (SELECT value FROM json_each(?2))
            )
            SELECT {PARSER_COLUMNS}
            FROM parsers
            WHERE identity IN (SELECT identity FROM closure)
              AND identity NOT IN (SELECT value FROM json_each(?2))
            "#
        );
        let rows: Vec<ParserRow> = sqlx::query_as(&sql)
            .bind(json_ids(roots)?)
            .bind(json_ids(exclude)?)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ParserRecord::from).collect())
    }

    async fn list_group(&self, kind: &str, only: Option<&[String]>) -> Result<Vec<ParserRecord>> {
        let sql = format!(
            r#"
            SELECT {PARSER_COLUMNS}
            FROM parsers
            WHERE substr(identity, 1, length(?1)) = ?1
              AND disabled = 0
              AND continuous = 0
            ORDER BY identity
            "#
        );
        let rows: Vec<ParserRow> = sqlx::query_as(&sql)
            .bind(kind_prefix(kind))
            .fetch_all(&self.pool)
            .await?;

        Ok(restrict(rows, only))
    }

    async fn list_continuous(&self, kind: &str) -> Result<Vec<ParserRecord>> {
        let sql = format!(
            r#"
            SELECT {PARSER_COLUMNS}
            FROM parsers
            WHERE substr(identity, 1, length(?1)) = ?1
              AND disabled = 0
              AND continuous = 1
            ORDER BY identity
            "#
        );
        let rows: Vec<ParserRow> = sqlx::query_as(&sql)
            .bind(kind_prefix(kind))
            .fetch_all(&self.pool)
            .await?;

        Ok(restrict(rows, None))
    }

    async fn list_all(&self) -> Result<Vec<ParserRecord>> {
        let sql = format!("SELECT {PARSER_COLUMNS} FROM parsers ORDER BY identity");
        let rows: Vec<ParserRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(ParserRecord::from).collect())
    }

    async fn list_changed(&self, known_hashes: &[String]) -> Result<Vec<ParserRecord>> {
        let sql = format!(
            "SELECT {PARSER_COLUMNS} FROM parsers \
             WHERE hash NOT IN (SELECT value FROM json_each(?)) ORDER BY identity"
        );
        let rows: Vec<ParserRow> = sqlx::query_as(&sql)
            .bind(json_ids(known_hashes)?)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ParserRecord::from).collect())
    }

    async fn upsert(&self, records: &[ParserRecord], batch_size: usize) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(Error::StoreWrite)?;

        for chunk in records.chunks(batch_size.max(1)) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO parsers (identity, provide, storage_keys, disabled, visibility, \
                 rate_requests, rate_window_seconds, continuous, code, source, hash, updated_at) ",
            );
            builder.push_values(chunk, |mut row, record| {
                let (visibility, rate_requests, rate_window_seconds) =
                    record.visibility.to_columns();
                row.push_bind(record.identity.clone())
                    .push_bind(Json(record.provide.clone()))
                    .push_bind(Json(record.storage_keys.clone()))
                    .push_bind(record.disabled)
                    .push_bind(visibility)
                    .push_bind(rate_requests)
                    .push_bind(rate_window_seconds)
                    .push_bind(record.continuous)
                    .push_bind(record.code.clone())
                    .push_bind(record.source.clone())
                    .push_bind(record.hash.clone())
                    .push_bind(record.updated_at);
            });
            builder.push(
                r#"
                ON CONFLICT (identity) DO UPDATE SET
                    provide = excluded.provide,
                    storage_keys = excluded.storage_keys,
                    disabled = excluded.disabled,
                    visibility = excluded.visibility,
                    rate_requests = excluded.rate_requests,
                    rate_window_seconds = excluded.rate_window_seconds,
                    continuous = excluded.continuous,
                    code = excluded.code,
                    source = excluded.source,
                    hash = excluded.hash,
                    updated_at = excluded.updated_at
                "#,
            );

            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(Error::StoreWrite)?;
        }

        tx.commit().await.map_err(Error::StoreWrite)?;

        tracing::debug!(count = records.len(), "Upserted parsers");
        Ok(())
    }

    async fn delete(&self, identities: &[String]) -> Result<Vec<String>> {
        if identities.is_empty() {
            return Ok(Vec::new());
        }
        let deleted: Vec<(String,)> = sqlx::query_as(
            "DELETE FROM parsers WHERE identity IN (SELECT value FROM json_each(?)) \
             RETURNING identity",
        )
        .bind(json_ids(identities)?)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::StoreWrite)?;

        Ok(deleted.into_iter().map(|(identity,)| identity).collect())
    }
}
