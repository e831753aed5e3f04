// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for parserhub.

use thiserror::Error;

use crate::context::DependencyMissing;
use crate::plugin::ParserError;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database read failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying migrations failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The pub/sub broker rejected an operation.
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    /// A parser's code could not be turned into a runnable parser.
    #[error("Failed to compile parser '{identity}': {reason}")]
    Compile {
        /// Parser identity.
        identity: String,
        /// Why compilation failed.
        reason: String,
    },

    /// A dependency was not available when accessed.
    #[error(transparent)]
    DependencyMissing(#[from] DependencyMissing),

    /// A parser raised an error while running.
    #[error("Parser execution failed: {0}")]
    Execution(#[from] ParserError),

    /// Parser record was not found.
    #[error("Parser not found: {0}")]
    ParserNotFound(String),

    /// The store rejected an upsert or delete.
    #[error("Store write failed: {0}")]
    StoreWrite(#[source] sqlx::Error),

    /// Managing the continuous runner process failed.
    #[error("Supervisor error: {0}")]
    Supervisor(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the engine Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Render an error and its source chain as a multi-line trace.
pub fn error_trace(err: &(dyn std::error::Error + 'static)) -> String {
    let mut trace = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        trace.push_str("\n  caused by: ");
        trace.push_str(&cause.to_string());
        source = cause.source();
    }
    trace
}
