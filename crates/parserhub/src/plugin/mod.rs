// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parser plugins.
//!
//! A parser's `code` is a JSON manifest naming a registered plugin and the
//! options to build it with:
//!
//! ```json
//! { "plugin": "http-json", "options": { "url": "https://example.com/feed.json" } }
//! ```
//!
//! Compiling a record looks the plugin up in the [`PluginRegistry`] and calls
//! its factory. The resulting [`Parser`] is what the compilation cache holds.

pub mod builtin;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::context::{DependencyMissing, ExecutionContext};
use crate::error::Error;
use crate::record::ParserRecord;

/// Lazily produced parser output.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<Value, ParserError>> + Send>>;

/// Errors raised by parsers while initializing or producing output.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParserError {
    /// A declared dependency could not be resolved.
    #[error(transparent)]
    DependencyMissing(#[from] DependencyMissing),

    /// An HTTP request made through the shared client failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Options in the manifest do not fit the plugin.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The parser reported a failure.
    #[error("{0}")]
    Failed(String),
}

/// A compiled parser.
///
/// `init` receives a fresh context per invocation and returns the output
/// sequence. Items are consumed in order; an `Err` item ends the run.
#[async_trait]
pub trait Parser: Send + Sync {
    /// Start an invocation.
    async fn init(&self, ctx: ExecutionContext) -> Result<OutputStream, ParserError>;
}

/// Builds a parser from manifest options.
pub type ParserFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn Parser>, ParserError> + Send + Sync>;

/// Parsed form of a record's `code`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    /// Registered plugin name
    pub plugin: String,
    /// Plugin-specific options
    #[serde(default)]
    pub options: Value,
}

/// Registry of plugin factories by name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, ParserFactory>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in plugins registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Arc<dyn Parser>, ParserError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Registered plugin names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Compile a record's code into a runnable parser.
    pub fn compile(&self, record: &ParserRecord) -> Result<Arc<dyn Parser>, Error> {
        let manifest: PluginManifest =
            serde_json::from_str(&record.code).map_err(|e| Error::Compile {
                identity: record.identity.clone(),
                reason: format!("invalid manifest: {}", e),
            })?;

        let factory = self
            .factories
            .get(&manifest.plugin)
            .ok_or_else(|| Error::Compile {
                identity: record.identity.clone(),
                reason: format!("unknown plugin '{}'", manifest.plugin),
            })?;

        factory(&manifest.options).map_err(|e| Error::Compile {
            identity: record.identity.clone(),
            reason: e.to_string(),
        })
    }
}
