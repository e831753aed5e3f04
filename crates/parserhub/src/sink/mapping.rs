// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mapping sink: merges items into an external cross-reference store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{CrossReferenceStore, GroupSink, Mapping, MergeOutcome};
use crate::context::ExecutionContext;

/// Merges `{"source": .., "target": ..}` items into a [`CrossReferenceStore`].
pub struct MappingSink {
    store: Arc<dyn CrossReferenceStore>,
}

impl MappingSink {
    /// Create a sink merging into `store`.
    pub fn new(store: Arc<dyn CrossReferenceStore>) -> Self {
        Self { store }
    }
}

fn parse_mapping(item: &Value) -> Option<Mapping> {
    let source = item.get("source")?.as_str()?;
    let target = item.get("target")?.as_str()?;
    if source.is_empty() || target.is_empty() {
        return None;
    }
    Some(Mapping {
        source: source.to_string(),
        target: target.to_string(),
    })
}

#[async_trait]
impl GroupSink for MappingSink {
    async fn on_item(&self, _ctx: &ExecutionContext, identity: &str, item: Value) -> bool {
        let Some(mapping) = parse_mapping(&item) else {
            warn!(identity, "Dropping malformed mapping item");
            return false;
        };

        match self.store.merge(identity, mapping).await {
            Ok(MergeOutcome::Merged) => true,
            Ok(MergeOutcome::Conflict(reason)) => {
                warn!(identity, %reason, "Mapping conflict");
                false
            }
            Err(e) => {
                warn!(identity, error = %e, "Cross-reference store rejected mapping");
                false
            }
        }
    }
}
