// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed parser store.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::{Error, Result};
use crate::record::ParserRecord;

use super::{PARSER_COLUMNS, ParserRow, ParserStore, kind_prefix, restrict};

/// PostgreSQL-backed parser store.
#[derive(Clone)]
pub struct PostgresParserStore {
    pool: PgPool,
}

impl PostgresParserStore {
    /// Create a store from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ParserStore for PostgresParserStore {
    async fn get(&self, identity: &str) -> Result<Option<ParserRecord>> {
        let sql = format!("SELECT {PARSER_COLUMNS} FROM parsers WHERE identity = $1");
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
        let sql = format!("SELECT {PARSER_COLUMNS} FROM parsers WHERE identity = ANY($1)");
        let rows: Vec<ParserRow> = sqlx::query_as(&sql)
            .bind(identities)
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
        // UNION (not UNION ALL) terminates on cyclic provide graphs.
        let sql = format!(
            r#"
            WITH RECURSIVE closure(identity) AS (
                SELECT unnest($1::text[])
                UNION
                SELECT dep.identity
                FROM parsers p
                JOIN closure c ON p.identity = c.identity
                CROSS JOIN LATERAL jsonb_array_elements_text(p.provide) AS dep(identity)
                WHERE NOT (c.identity = ANY($2::text[]))
            )
            SELECT {PARSER_COLUMNS}
            FROM parsers
            WHERE identity IN (SELECT identity FROM closure)
              AND NOT (identity = ANY($2::text[]))
            "#
        );
        let rows: Vec<ParserRow> = sqlx::query_as(&sql)
            .bind(roots)
            .bind(exclude)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ParserRecord::from).collect())
    }

    async fn list_group(&self, kind: &str, only: Option<&[String]>) -> Result<Vec<ParserRecord>> {
        let sql = format!(
            r#"
            SELECT {PARSER_COLUMNS}
            FROM parsers
            WHERE left(identity, length($1)) = $1
              AND NOT disabled
              AND NOT continuous
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
            WHERE left(identity, length($1)) = $1
              AND NOT disabled
              AND continuous
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
            "SELECT {PARSER_COLUMNS} FROM parsers WHERE NOT (hash = ANY($1)) ORDER BY identity"
        );
        let rows: Vec<ParserRow> = sqlx::query_as(&sql)
            .bind(known_hashes)
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
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
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
                    provide = EXCLUDED.provide,
                    storage_keys = EXCLUDED.storage_keys,
                    disabled = EXCLUDED.disabled,
                    visibility = EXCLUDED.visibility,
                    rate_requests = EXCLUDED.rate_requests,
                    rate_window_seconds = EXCLUDED.rate_window_seconds,
                    continuous = EXCLUDED.continuous,
                    code = EXCLUDED.code,
                    source = EXCLUDED.source,
                    hash = EXCLUDED.hash,
                    updated_at = EXCLUDED.updated_at
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
        let deleted: Vec<(String,)> =
            sqlx::query_as("DELETE FROM parsers WHERE identity = ANY($1) RETURNING identity")
                .bind(identities)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::StoreWrite)?;

        Ok(deleted.into_iter().map(|(identity,)| identity).collect())
    }
}
