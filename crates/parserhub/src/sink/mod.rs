// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain sinks.
//!
//! A [`GroupSink`] receives every item a root parser yields during a group
//! run. Sinks never fail a run: recoverable problems are logged and the item
//! is reported as not accepted. Only accepted items count towards a parser's
//! statistics.
//!
//! The concrete stores behind the import, cleanup and mapping sinks are
//! outside the engine and plugged in through [`ImportTarget`],
//! [`DeletionTarget`] and [`CrossReferenceStore`].

pub mod cleanup;
pub mod import;
pub mod mapping;

pub use self::cleanup::CleanupSink;
pub use self::import::ImportSink;
pub use self::mapping::MappingSink;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::error::Result;

/// Kind whose items are imported.
pub const IMPORT_KIND: &str = "importers";
/// Kind whose items are deletion keys.
pub const CLEANUP_KIND: &str = "cleaners";
/// Kind whose items are cross-reference mappings.
pub const MAPPING_KIND: &str = "mappers";

/// Receives the output of one group's parsers.
#[async_trait]
pub trait GroupSink: Send + Sync {
    /// Handle one item yielded by `identity`. Returns whether it was accepted.
    async fn on_item(&self, ctx: &ExecutionContext, identity: &str, item: Value) -> bool;

    /// Push out anything still buffered. Called once after every group run.
    async fn flush(&self) {}
}

/// Destination of validated import items.
#[async_trait]
pub trait ImportTarget: Send + Sync {
    /// Store one validated item produced by `identity`.
    async fn import(&self, identity: &str, item: ImportItem) -> Result<()>;
}

/// Destination of cleanup deletion keys.
#[async_trait]
pub trait DeletionTarget: Send + Sync {
    /// Delete everything identified by `keys`. Returns how many were removed.
    async fn delete_many(&self, keys: Vec<String>) -> Result<u64>;
}

/// Result of merging one mapping item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The mapping was recorded.
    Merged,
    /// The mapping contradicts an existing one and was not recorded.
    Conflict(String),
}

/// External cross-reference store fed by mapping parsers.
#[async_trait]
pub trait CrossReferenceStore: Send + Sync {
    /// Merge one mapping produced by `identity`.
    async fn merge(&self, identity: &str, mapping: Mapping) -> Result<MergeOutcome>;
}

/// An import item that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportItem {
    /// Link to the imported content
    pub url: String,
    /// Display title
    pub title: String,
    /// The whole item as yielded
    pub raw: Value,
}

/// A mapping item that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Key on the parser's side
    pub source: String,
    /// Key in the cross-reference store
    pub target: String,
}

/// Target that only logs what it receives. Used by the standalone binary
/// when no domain store is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTarget;

#[async_trait]
impl ImportTarget for LogTarget {
    async fn import(&self, identity: &str, item: ImportItem) -> Result<()> {
        debug!(identity, url = %item.url, title = %item.title, "Imported item");
        Ok(())
    }
}

#[async_trait]
impl DeletionTarget for LogTarget {
    async fn delete_many(&self, keys: Vec<String>) -> Result<u64> {
        info!(count = keys.len(), "Cleanup batch");
        Ok(keys.len() as u64)
    }
}

#[async_trait]
impl CrossReferenceStore for LogTarget {
    async fn merge(&self, identity: &str, mapping: Mapping) -> Result<MergeOutcome> {
        debug!(identity, source = %mapping.source, target = %mapping.target, "Mapped");
        Ok(MergeOutcome::Merged)
    }
}
