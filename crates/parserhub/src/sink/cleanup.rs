// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cleanup sink: buffers deletion keys and deletes them in bulk.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::{DeletionTarget, GroupSink};
use crate::context::ExecutionContext;

/// Treats items as deletion keys and flushes them once `threshold` are buffered.
pub struct CleanupSink {
    target: Arc<dyn DeletionTarget>,
    threshold: usize,
    buffer: Mutex<Vec<String>>,
}

impl CleanupSink {
    /// Create a sink feeding `target` in batches of `threshold` keys.
    pub fn new(target: Arc<dyn DeletionTarget>, threshold: usize) -> Self {
        Self {
            target,
            threshold: threshold.max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Number of keys waiting for the next flush.
    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    async fn delete(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        let requested = keys.len();
        match self.target.delete_many(keys).await {
            Ok(deleted) => debug!(requested, deleted, "Flushed cleanup batch"),
            Err(e) => error!(requested, error = %e, "Cleanup batch failed"),
        }
    }
}

fn deletion_key(item: &Value) -> Option<String> {
    match item {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl GroupSink for CleanupSink {
    async fn on_item(&self, _ctx: &ExecutionContext, identity: &str, item: Value) -> bool {
        let Some(key) = deletion_key(&item) else {
            warn!(identity, "Dropping cleanup item that is not a key");
            return false;
        };

        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(key);
            if buffer.len() >= self.threshold {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };
        if let Some(keys) = full {
            self.delete(keys).await;
        }
        true
    }

    async fn flush(&self) {
        let keys = std::mem::take(&mut *self.buffer.lock().await);
        self.delete(keys).await;
    }
}
