// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution contexts.
//!
//! Every invocation gets a fresh [`ExecutionContext`] exposing configuration,
//! the shared library surface, a statistics counter and handles to the
//! parser's declared dependencies. Dependency handles are built lazily on
//! first access and memoized; nested contexts share the root's counter and
//! report under the root's identity.
//!
//! Building a context never executes anything and never fails. Problems
//! with dependencies surface as [`DependencyMissing`] when the parser first
//! asks for the dependency.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use thiserror::Error;

use crate::cache::ParserCache;
use crate::plugin::{OutputStream, Parser, ParserError};
use crate::record::ParserRecord;

/// Caller-supplied invocation input.
pub type Parameters = serde_json::Map<String, Value>;

/// Maximum length of a root-to-dependency chain.
pub const MAX_DEPENDENCY_DEPTH: usize = 32;

/// Why a dependency could not be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingReason {
    /// The parser did not declare the identity in `provide`.
    Undeclared,
    /// The dependency is not resident in the compilation cache.
    NotLoaded,
    /// The dependency is already an ancestor of the requesting context.
    Cycle,
    /// The chain of nested contexts is too deep.
    DepthExceeded,
}

impl fmt::Display for MissingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingReason::Undeclared => write!(f, "not declared in provide"),
            MissingReason::NotLoaded => write!(f, "not loaded"),
            MissingReason::Cycle => write!(f, "dependency cycle"),
            MissingReason::DepthExceeded => {
                write!(f, "nesting deeper than {}", MAX_DEPENDENCY_DEPTH)
            }
        }
    }
}

/// A dependency was unavailable at first access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Dependency '{identity}' requested by '{requested_by}' is missing: {reason}")]
pub struct DependencyMissing {
    /// The dependency identity.
    pub identity: String,
    /// The parser that asked for it.
    pub requested_by: String,
    /// Why it is unavailable.
    pub reason: MissingReason,
}

/// Helpers shared by every parser in the process.
#[derive(Debug, Clone)]
pub struct Library {
    http: reqwest::Client,
}

impl Library {
    /// Create a library around an HTTP client.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Shared HTTP client.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

impl Default for Library {
    fn default() -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("parserhub/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { http }
    }
}

/// Builds execution contexts wired to a compilation cache.
#[derive(Clone)]
pub struct ContextBuilder {
    cache: Arc<ParserCache>,
    config: Arc<Value>,
    library: Arc<Library>,
}

impl ContextBuilder {
    /// Create a builder with empty configuration and a default library.
    pub fn new(cache: Arc<ParserCache>) -> Self {
        Self {
            cache,
            config: Arc::new(Value::Object(Default::default())),
            library: Arc::new(Library::default()),
        }
    }

    /// Set the configuration exposed to parsers.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Set the shared library surface.
    pub fn with_library(mut self, library: Library) -> Self {
        self.library = Arc::new(library);
        self
    }

    /// The cache dependencies are resolved from.
    pub fn cache(&self) -> &Arc<ParserCache> {
        &self.cache
    }

    /// Build a root context with a fresh statistics counter.
    pub fn build(&self, record: &ParserRecord, parameters: Parameters) -> ExecutionContext {
        self.build_node(record, parameters, None)
    }

    fn build_node(
        &self,
        record: &ParserRecord,
        parameters: Parameters,
        parent: Option<&ContextInner>,
    ) -> ExecutionContext {
        let (root, counter, mut lineage) = match parent {
            Some(parent) => (
                parent.root.clone(),
                parent.counter.clone(),
                parent.lineage.clone(),
            ),
            None => (
                record.identity.clone(),
                Arc::new(AtomicU64::new(0)),
                Vec::new(),
            ),
        };
        lineage.push(record.identity.clone());

        let dependencies = record
            .provide
            .iter()
            .map(|identity| (identity.clone(), OnceLock::new()))
            .collect();

        ExecutionContext {
            inner: Arc::new(ContextInner {
                identity: record.identity.clone(),
                root,
                provide: record.provide.clone(),
                parameters,
                counter,
                lineage,
                dependencies,
                builder: self.clone(),
            }),
        }
    }
}

struct ContextInner {
    identity: String,
    root: String,
    provide: Vec<String>,
    parameters: Parameters,
    counter: Arc<AtomicU64>,
    /// Identities from the root down to this context, inclusive.
    lineage: Vec<String>,
    dependencies: HashMap<String, OnceLock<Result<DependencyHandle, DependencyMissing>>>,
    builder: ContextBuilder,
}

/// Runtime context of one invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("identity", &self.inner.identity)
            .field("root", &self.inner.root)
            .field("depth", &self.depth())
            .finish()
    }
}

impl ExecutionContext {
    /// Identity of the parser this context belongs to.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Identity of the root parser of this invocation tree.
    pub fn root(&self) -> &str {
        &self.inner.root
    }

    /// 0 for the root, 1 for its direct dependencies, and so on.
    pub fn depth(&self) -> usize {
        self.inner.lineage.len() - 1
    }

    /// Invocation parameters.
    pub fn parameters(&self) -> &Parameters {
        &self.inner.parameters
    }

    /// A single invocation parameter.
    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.inner.parameters.get(key)
    }

    /// Engine configuration exposed to parsers.
    pub fn config(&self) -> &Value {
        &self.inner.builder.config
    }

    /// Shared library surface.
    pub fn library(&self) -> &Library {
        &self.inner.builder.library
    }

    /// Declared dependencies in `provide` order.
    pub fn declared_dependencies(&self) -> &[String] {
        &self.inner.provide
    }

    /// Add to the invocation tree's statistics counter.
    pub fn record_items(&self, count: u64) {
        self.inner.counter.fetch_add(count, Ordering::Relaxed);
    }

    /// Current value of the invocation tree's statistics counter.
    pub fn items(&self) -> u64 {
        self.inner.counter.load(Ordering::Relaxed)
    }

    /// Tracing span reporting under the root parser.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("parser", identity = %self.inner.identity, root = %self.inner.root)
    }

    /// Handle to a declared dependency, built on first access.
    pub fn dependency(&self, identity: &str) -> Result<DependencyHandle, DependencyMissing> {
        let Some(slot) = self.inner.dependencies.get(identity) else {
            return Err(self.missing(identity, MissingReason::Undeclared));
        };
        slot.get_or_init(|| self.resolve(identity)).clone()
    }

    fn resolve(&self, identity: &str) -> Result<DependencyHandle, DependencyMissing> {
        if self.inner.lineage.iter().any(|ancestor| ancestor == identity) {
            return Err(self.missing(identity, MissingReason::Cycle));
        }
        if self.inner.lineage.len() >= MAX_DEPENDENCY_DEPTH {
            return Err(self.missing(identity, MissingReason::DepthExceeded));
        }

        let compiled = self
            .inner
            .builder
            .cache
            .get(identity)
            .ok_or_else(|| self.missing(identity, MissingReason::NotLoaded))?;

        let context = self.inner.builder.build_node(
            &compiled.record,
            self.inner.parameters.clone(),
            Some(self.inner.as_ref()),
        );

        Ok(DependencyHandle {
            identity: identity.to_string(),
            parser: compiled.parser,
            context,
        })
    }

    fn missing(&self, identity: &str, reason: MissingReason) -> DependencyMissing {
        DependencyMissing {
            identity: identity.to_string(),
            requested_by: self.inner.identity.clone(),
            reason,
        }
    }
}

/// A resolved dependency: its parser and its nested context.
#[derive(Clone)]
pub struct DependencyHandle {
    identity: String,
    parser: Arc<dyn Parser>,
    context: ExecutionContext,
}

impl fmt::Debug for DependencyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyHandle")
            .field("identity", &self.identity)
            .field("context", &self.context)
            .finish()
    }
}

impl DependencyHandle {
    /// Dependency identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The dependency's own context.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Start the dependency's output sequence.
    pub async fn run(&self) -> Result<OutputStream, ParserError> {
        self.parser.init(self.context.clone()).await
    }
}
