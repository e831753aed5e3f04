// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Import sink: validates item shape before forwarding.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{GroupSink, ImportItem, ImportTarget};
use crate::context::ExecutionContext;

/// Forwards well-formed import items to an [`ImportTarget`].
///
/// An item must be an object with non-empty string `url` and `title`
/// fields. Anything else is dropped with a warning.
pub struct ImportSink {
    target: Arc<dyn ImportTarget>,
}

impl ImportSink {
    /// Create a sink feeding `target`.
    pub fn new(target: Arc<dyn ImportTarget>) -> Self {
        Self { target }
    }
}

/// Check the mandatory import shape.
pub fn validate(item: Value) -> Result<ImportItem, String> {
    let field = |name: &str| -> Result<String, String> {
        match item.get(name) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            Some(Value::String(_)) => Err(format!("'{}' is empty", name)),
            Some(_) => Err(format!("'{}' is not a string", name)),
            None => Err(format!("'{}' is missing", name)),
        }
    };

    if !item.is_object() {
        return Err("item is not an object".to_string());
    }
    let url = field("url")?;
    let title = field("title")?;

    Ok(ImportItem {
        url,
        title,
        raw: item,
    })
}

#[async_trait]
impl GroupSink for ImportSink {
    async fn on_item(&self, ctx: &ExecutionContext, identity: &str, item: Value) -> bool {
        let item = match validate(item) {
            Ok(item) => item,
            Err(reason) => {
                warn!(identity, root = ctx.root(), %reason, "Dropping malformed output item");
                return false;
            }
        };

        match self.target.import(identity, item).await {
            Ok(()) => true,
            Err(e) => {
                warn!(identity, error = %e, "Import target rejected item");
                false
            }
        }
    }
}
