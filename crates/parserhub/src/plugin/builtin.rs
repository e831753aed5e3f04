// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in plugins.
//!
//! | Plugin      | Options                         | Output                                   |
//! |-------------|---------------------------------|------------------------------------------|
//! | `static`    | `items: [..]`                   | the items, in order                      |
//! | `http-json` | `url`, optional `pointer`       | elements of the JSON array at `pointer`  |
//! | `chain`     | none                            | output of every dependency, in order     |
//! | `fail`      | optional `message`              | fails immediately                        |

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{OutputStream, Parser, ParserError, PluginRegistry};
use crate::context::ExecutionContext;

/// Register every built-in plugin.
pub fn register_all(registry: &mut PluginRegistry) {
    registry
        .register("static", StaticParser::from_options)
        .register("http-json", HttpJsonParser::from_options)
        .register("chain", |_: &Value| Ok(Arc::new(ChainParser) as Arc<dyn Parser>))
        .register("fail", FailParser::from_options);
}

fn parse_options<T: DeserializeOwned>(options: &Value) -> Result<T, ParserError> {
    let value = if options.is_null() {
        Value::Object(Default::default())
    } else {
        options.clone()
    };
    serde_json::from_value(value).map_err(|e| ParserError::InvalidOptions(e.to_string()))
}

/// Yields a fixed list of items.
#[derive(Debug, Clone)]
pub struct StaticParser {
    items: Vec<Value>,
}

#[derive(Deserialize)]
struct StaticOptions {
    #[serde(default)]
    items: Vec<Value>,
}

impl StaticParser {
    /// Build from `{"items": [..]}`.
    pub fn from_options(options: &Value) -> Result<Arc<dyn Parser>, ParserError> {
        let StaticOptions { items } = parse_options(options)?;
        Ok(Arc::new(Self { items }))
    }
}

#[async_trait]
impl Parser for StaticParser {
    async fn init(&self, _ctx: ExecutionContext) -> Result<OutputStream, ParserError> {
        Ok(stream::iter(self.items.clone().into_iter().map(Ok)).boxed())
    }
}

/// Fetches a JSON document and yields the elements of one of its arrays.
#[derive(Debug, Clone)]
pub struct HttpJsonParser {
    url: String,
    pointer: String,
}

#[derive(Deserialize)]
struct HttpJsonOptions {
    url: String,
    #[serde(default)]
    pointer: String,
}

impl HttpJsonParser {
    /// Build from `{"url": "...", "pointer": "/data/items"}`.
    pub fn from_options(options: &Value) -> Result<Arc<dyn Parser>, ParserError> {
        let HttpJsonOptions { url, pointer } = parse_options(options)?;
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(ParserError::InvalidOptions(format!(
                "pointer '{}' must start with '/'",
                pointer
            )));
        }
        Ok(Arc::new(Self { url, pointer }))
    }
}

#[async_trait]
impl Parser for HttpJsonParser {
    async fn init(&self, ctx: ExecutionContext) -> Result<OutputStream, ParserError> {
        let document: Value = ctx
            .library()
            .http()
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match document.pointer(&self.pointer) {
            Some(Value::Array(items)) => {
                Ok(stream::iter(items.clone().into_iter().map(Ok)).boxed())
            }
            Some(_) => Err(ParserError::Failed(format!(
                "value at '{}' in {} is not an array",
                self.pointer, self.url
            ))),
            None => Err(ParserError::Failed(format!(
                "nothing at '{}' in {}",
                self.pointer, self.url
            ))),
        }
    }
}

/// Runs every declared dependency in order and yields their output.
#[derive(Debug, Clone, Copy)]
pub struct ChainParser;

#[async_trait]
impl Parser for ChainParser {
    async fn init(&self, ctx: ExecutionContext) -> Result<OutputStream, ParserError> {
        let handles = ctx
            .declared_dependencies()
            .iter()
            .map(|identity| ctx.dependency(identity))
            .collect::<Result<Vec<_>, _>>()?;

        let output = stream::iter(handles)
            .then(|handle| async move {
                match handle.run().await {
                    Ok(items) => items,
                    Err(e) => stream::once(async move { Err(e) }).boxed(),
                }
            })
            .flatten();

        Ok(output.boxed())
    }
}

/// Fails immediately.
#[derive(Debug, Clone)]
pub struct FailParser {
    message: String,
}

#[derive(Deserialize)]
struct FailOptions {
    #[serde(default = "default_fail_message")]
    message: String,
}

fn default_fail_message() -> String {
    "parser failed".to_string()
}

impl FailParser {
    /// Build from `{"message": "..."}`.
    pub fn from_options(options: &Value) -> Result<Arc<dyn Parser>, ParserError> {
        let FailOptions { message } = parse_options(options)?;
        Ok(Arc::new(Self { message }))
    }
}

#[async_trait]
impl Parser for FailParser {
    async fn init(&self, _ctx: ExecutionContext) -> Result<OutputStream, ParserError> {
        Err(ParserError::Failed(self.message.clone()))
    }
}
