// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! parserhub - Parser Execution & Distribution Engine
//!
//! Stores small, independently versioned parsers, resolves their dependency
//! graphs, compiles and caches them per process, runs them in scheduled
//! groups or as long-running jobs, and synchronizes them with external
//! authoring tools.
//!
//! # Architecture
//!
//! ```text
//!   authoring tool                  scheduler / API
//!        │ pull / push                    │ run group
//!        ▼                                ▼
//! ┌──────────────┐  invalidate   ┌──────────────────┐   items   ┌────────────┐
//! │ SyncService  │──────────────►│   BatchRunner    │──────────►│ GroupSink  │
//! └──────┬───────┘   (pub/sub)   └────────┬─────────┘           └────────────┘
//!        │                  │             │ ensure loaded / build context
//!        │ upsert/delete    │             ▼
//!        │                  │    ┌──────────────────┐   closure  ┌────────────┐
//!        │                  └───►│   ParserCache    │──────────►│ ParserStore│
//!        │                       └────────┬─────────┘            └─────┬──────┘
//!        │                                │ compile                    │
//!        │                                ▼                            │
//!        │                       ┌──────────────────┐                  │
//!        │                       │  PluginRegistry  │                  │
//!        │                       └──────────────────┘                  │
//!        └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every process keeps its own [`cache::ParserCache`]. Writes go through
//! [`sync::SyncService`], which announces changed identities on the
//! invalidation channel after committing; each process's
//! [`invalidation::InvalidationListener`] evicts them.
//!
//! # Parser Code
//!
//! A parser's `code` is a JSON plugin manifest, e.g.
//! `{"plugin": "static", "options": {"items": [1, 2]}}`, compiled by the
//! [`plugin::PluginRegistry`]. See [`plugin::builtin`] for the built-ins.
//!
//! # Processes
//!
//! | Command | Role |
//! |---------|------|
//! | `parserhub serve` | Host process: invalidation listener, continuous runner supervisor and watcher |
//! | `parserhub run-group <kind>` | One-shot batch run of a group |
//! | `parserhub continuous` | Continuous runner process |
//! | `parserhub pull` / `push` | Operator access to the sync protocol |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PARSERHUB_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `PARSERHUB_REDIS_URL` | No | `redis://127.0.0.1:6379` | Pub/sub broker |
//! | `PARSERHUB_INVALIDATION_CHANNEL` | No | `parserhub:invalidate` | Channel name |
//! | `PARSERHUB_BATCH_CONCURRENCY` | No | `4` | Parsers running at once per group |
//! | `PARSERHUB_UPSERT_BATCH_SIZE` | No | `100` | Rows per bulk upsert statement |
//! | `PARSERHUB_CLEANUP_BUFFER` | No | `500` | Cleanup sink flush threshold |
//! | `PARSERHUB_CONTINUOUS_KIND` | No | `importers` | Kind run by the continuous runner |

#![deny(missing_docs)]

/// Batch runner for groups of parsers.
pub mod batch;

/// Per-process compilation cache.
pub mod cache;

/// Configuration loaded from environment variables.
pub mod config;

/// Execution contexts and dependency handles.
pub mod context;

/// Continuous runner, its process supervisor and the restart watcher.
pub mod continuous;

/// Error types.
pub mod error;

/// Cross-process cache invalidation.
pub mod invalidation;

/// Embedded database migrations.
pub mod migrations;

/// Parser trait, plugin registry and built-in plugins.
pub mod plugin;

/// Parser records, hashing and source compression.
pub mod record;

/// In-flight run state per group kind.
pub mod run_state;

/// Embeddable engine wiring every component together.
pub mod runtime;

/// Domain sinks for parser output.
pub mod sink;

/// Parser store interface and backends.
pub mod store;

/// Pull/push synchronization protocol.
pub mod sync;

pub use error::{Error, Result};
pub use runtime::Engine;
