// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for parserhub.

use std::str::FromStr;

/// Default Redis URL used for invalidation broadcasts.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
/// Default pub/sub channel carrying invalidation messages.
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "parserhub:invalidate";
/// Default number of parsers a group run executes at the same time.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;
/// Default number of rows per bulk upsert statement.
pub const DEFAULT_UPSERT_BATCH_SIZE: usize = 100;
/// Default number of deletion keys buffered by the cleanup sink before a flush.
pub const DEFAULT_CLEANUP_BUFFER: usize = 500;
/// Default kind scanned by the continuous runner.
pub const DEFAULT_CONTINUOUS_KIND: &str = "importers";

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL of the parser store
    pub database_url: String,
    /// Redis URL for the invalidation channel
    pub redis_url: String,
    /// Name of the invalidation pub/sub channel
    pub invalidation_channel: String,
    /// Upper bound on simultaneously running parsers within a group
    pub batch_concurrency: usize,
    /// Rows per bulk upsert statement
    pub upsert_batch_size: usize,
    /// Cleanup sink flush threshold
    pub cleanup_buffer: usize,
    /// Kind whose continuous parsers the continuous runner starts
    pub continuous_kind: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("PARSERHUB_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("PARSERHUB_DATABASE_URL or DATABASE_URL"))?;

        let redis_url =
            std::env::var("PARSERHUB_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());

        let invalidation_channel = std::env::var("PARSERHUB_INVALIDATION_CHANNEL")
            .unwrap_or_else(|_| DEFAULT_INVALIDATION_CHANNEL.to_string());

        let batch_concurrency =
            positive_from_env("PARSERHUB_BATCH_CONCURRENCY", DEFAULT_BATCH_CONCURRENCY)?;
        let upsert_batch_size =
            positive_from_env("PARSERHUB_UPSERT_BATCH_SIZE", DEFAULT_UPSERT_BATCH_SIZE)?;
        let cleanup_buffer = positive_from_env("PARSERHUB_CLEANUP_BUFFER", DEFAULT_CLEANUP_BUFFER)?;

        let continuous_kind = std::env::var("PARSERHUB_CONTINUOUS_KIND")
            .unwrap_or_else(|_| DEFAULT_CONTINUOUS_KIND.to_string());

        Ok(Self {
            database_url,
            redis_url,
            invalidation_channel,
            batch_concurrency,
            upsert_batch_size,
            cleanup_buffer,
            continuous_kind,
        })
    }
}

fn positive_from_env(var: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_positive(var, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_positive(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match usize::from_str(raw.trim()) {
        Ok(0) | Err(_) => Err(ConfigError::InvalidValue {
            var,
            value: raw.to_string(),
        }),
        Ok(value) => Ok(value),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A numeric variable is not a positive integer.
    #[error("Invalid value for {var}: '{value}' (expected a positive integer)")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
