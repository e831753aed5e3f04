// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine.
//!
//! [`Engine`] wires the store, compilation cache, context builder, runners,
//! sync protocol and invalidation listener together. The API layer and the
//! standalone binary both drive the engine through it.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use parserhub::invalidation::RedisBus;
//! use parserhub::runtime::Engine;
//! use parserhub::store::PostgresParserStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     parserhub::migrations::run_postgres(&pool).await?;
//!     let bus = RedisBus::connect("redis://127.0.0.1:6379", "parserhub:invalidate").await?;
//!
//!     let engine = Engine::builder()
//!         .store(Arc::new(PostgresParserStore::new(pool)))
//!         .bus(Arc::new(bus))
//!         .log_sinks()
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let report = engine.run_group("importers", None).await?;
//!     println!("{} items", report.total);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt;
use serde_json::Value;
use tracing::{Instrument, error, info};

use crate::batch::{BatchRunner, GroupReport, LogReporter, StatsReporter};
use crate::cache::ParserCache;
use crate::config::{
    Config, DEFAULT_BATCH_CONCURRENCY, DEFAULT_CLEANUP_BUFFER, DEFAULT_CONTINUOUS_KIND,
    DEFAULT_UPSERT_BATCH_SIZE,
};
use crate::context::{ContextBuilder, Library, Parameters};
use crate::continuous::{ContinuousRunner, ContinuousSupervisor, ContinuousWatcher};
use crate::error::{Error, Result};
use crate::invalidation::{InvalidationBus, InvalidationListener, ListenerHandle};
use crate::plugin::PluginRegistry;
use crate::record::ParserDocument;
use crate::run_state::RunStateRegistry;
use crate::sink::{
    CLEANUP_KIND, CleanupSink, GroupSink, IMPORT_KIND, ImportSink, LogTarget, MAPPING_KIND,
    MappingSink,
};
use crate::store::ParserStore;
use crate::sync::{PushRequest, PushResponse, SyncService};

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    store: Option<Arc<dyn ParserStore>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    registry: PluginRegistry,
    supervisor: Option<Arc<dyn ContinuousSupervisor>>,
    reporter: Arc<dyn StatsReporter>,
    sinks: HashMap<String, Arc<dyn GroupSink>>,
    parser_config: Value,
    library: Library,
    batch_concurrency: usize,
    upsert_batch_size: usize,
    cleanup_buffer: usize,
    continuous_kind: String,
    listen: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            bus: None,
            registry: PluginRegistry::with_builtins(),
            supervisor: None,
            reporter: Arc::new(LogReporter),
            sinks: HashMap::new(),
            parser_config: Value::Object(Default::default()),
            library: Library::default(),
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            upsert_batch_size: DEFAULT_UPSERT_BATCH_SIZE,
            cleanup_buffer: DEFAULT_CLEANUP_BUFFER,
            continuous_kind: DEFAULT_CONTINUOUS_KIND.to_string(),
            listen: true,
        }
    }
}

impl EngineBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the tunables from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.batch_concurrency = config.batch_concurrency;
        self.upsert_batch_size = config.upsert_batch_size;
        self.cleanup_buffer = config.cleanup_buffer;
        self.continuous_kind = config.continuous_kind.clone();
        self
    }

    /// Set the parser store (required).
    pub fn store(mut self, store: Arc<dyn ParserStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the invalidation bus (required).
    pub fn bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replace the plugin registry.
    ///
    /// Default: the built-in plugins.
    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the supervisor restarted when continuous parsers change.
    ///
    /// With listening enabled the engine watches the invalidation channel
    /// and restarts it for pushes made by any process. Otherwise only this
    /// engine's own pushes restart it.
    pub fn supervisor(mut self, supervisor: Arc<dyn ContinuousSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Set the statistics reporter.
    ///
    /// Default: [`LogReporter`]
    pub fn reporter(mut self, reporter: Arc<dyn StatsReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Register the sink receiving output of parsers of `kind`.
    pub fn sink(mut self, kind: impl Into<String>, sink: Arc<dyn GroupSink>) -> Self {
        self.sinks.insert(kind.into(), sink);
        self
    }

    /// Register import, cleanup and mapping sinks that only log.
    pub fn log_sinks(self) -> Self {
        let cleanup_buffer = self.cleanup_buffer;
        self.sink(IMPORT_KIND, Arc::new(ImportSink::new(Arc::new(LogTarget))))
            .sink(
                CLEANUP_KIND,
                Arc::new(CleanupSink::new(Arc::new(LogTarget), cleanup_buffer)),
            )
            .sink(MAPPING_KIND, Arc::new(MappingSink::new(Arc::new(LogTarget))))
    }

    /// Configuration exposed to parsers through their context.
    pub fn parser_config(mut self, config: Value) -> Self {
        self.parser_config = config;
        self
    }

    /// Set the library surface exposed to parsers.
    pub fn library(mut self, library: Library) -> Self {
        self.library = library;
        self
    }

    /// Set the number of parsers a group run executes at the same time.
    ///
    /// Default: 4
    pub fn batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency;
        self
    }

    /// Set the rows per bulk upsert statement.
    ///
    /// Default: 100
    pub fn upsert_batch_size(mut self, size: usize) -> Self {
        self.upsert_batch_size = size;
        self
    }

    /// Set the cleanup sink flush threshold used by [`log_sinks`](Self::log_sinks).
    ///
    /// Default: 500
    pub fn cleanup_buffer(mut self, size: usize) -> Self {
        self.cleanup_buffer = size;
        self
    }

    /// Set the kind scanned by the continuous runner.
    ///
    /// Default: `importers`
    pub fn continuous_kind(mut self, kind: impl Into<String>) -> Self {
        self.continuous_kind = kind.into();
        self
    }

    /// Whether to subscribe to invalidations on start.
    ///
    /// Default: true
    pub fn listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    /// Validate the configuration.
    pub fn build(self) -> anyhow::Result<EngineConfig> {
        let store = self.store.context("store is required")?;
        let bus = self.bus.context("bus is required")?;
        if self.batch_concurrency == 0 {
            anyhow::bail!("batch_concurrency must be positive");
        }

        Ok(EngineConfig {
            store,
            bus,
            registry: self.registry,
            supervisor: self.supervisor,
            reporter: self.reporter,
            sinks: self.sinks,
            parser_config: self.parser_config,
            library: self.library,
            batch_concurrency: self.batch_concurrency,
            upsert_batch_size: self.upsert_batch_size,
            continuous_kind: self.continuous_kind,
            listen: self.listen,
        })
    }
}

/// Validated configuration of an [`Engine`].
pub struct EngineConfig {
    store: Arc<dyn ParserStore>,
    bus: Arc<dyn InvalidationBus>,
    registry: PluginRegistry,
    supervisor: Option<Arc<dyn ContinuousSupervisor>>,
    reporter: Arc<dyn StatsReporter>,
    sinks: HashMap<String, Arc<dyn GroupSink>>,
    parser_config: Value,
    library: Library,
    batch_concurrency: usize,
    upsert_batch_size: usize,
    continuous_kind: String,
    listen: bool,
}

impl EngineConfig {
    /// Wire the components and subscribe to invalidations.
    pub async fn start(self) -> Result<Engine> {
        let cache = Arc::new(ParserCache::new(
            self.store.clone(),
            Arc::new(self.registry),
        ));
        let contexts = ContextBuilder::new(cache.clone())
            .with_config(self.parser_config)
            .with_library(self.library);
        let run_state = RunStateRegistry::new();

        let batch = BatchRunner::new(contexts.clone(), run_state.clone(), self.batch_concurrency)
            .with_reporter(self.reporter);

        let listener = if self.listen {
            Some(
                InvalidationListener::new(self.bus.clone(), cache.clone())
                    .spawn()
                    .await?,
            )
        } else {
            None
        };

        let watcher = match &self.supervisor {
            Some(supervisor) if self.listen => Some(
                ContinuousWatcher::new(
                    self.bus.clone(),
                    self.store.clone(),
                    supervisor.clone(),
                    self.continuous_kind.clone(),
                )
                .spawn()
                .await?,
            ),
            _ => None,
        };

        let mut sync = SyncService::new(self.store.clone(), self.bus.clone())
            .with_batch_size(self.upsert_batch_size);
        // A running watcher sees this engine's pushes on the channel too
        if let Some(supervisor) = &self.supervisor
            && watcher.is_none()
        {
            sync = sync.with_supervisor(supervisor.clone());
        }

        info!(
            concurrency = self.batch_concurrency,
            sinks = self.sinks.len(),
            listening = listener.is_some(),
            watching = watcher.is_some(),
            "Engine started"
        );

        Ok(Engine {
            cache,
            contexts,
            run_state,
            batch,
            sync,
            sinks: self.sinks,
            supervisor: self.supervisor,
            continuous_kind: self.continuous_kind,
            listener,
            watcher,
        })
    }
}

/// A running engine.
pub struct Engine {
    cache: Arc<ParserCache>,
    contexts: ContextBuilder,
    run_state: RunStateRegistry,
    batch: BatchRunner,
    sync: SyncService,
    sinks: HashMap<String, Arc<dyn GroupSink>>,
    supervisor: Option<Arc<dyn ContinuousSupervisor>>,
    continuous_kind: String,
    listener: Option<ListenerHandle>,
    watcher: Option<ListenerHandle>,
}

impl Engine {
    /// Create a new builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The process's compilation cache.
    pub fn cache(&self) -> &Arc<ParserCache> {
        &self.cache
    }

    /// Run states of every kind.
    pub fn run_state(&self) -> &RunStateRegistry {
        &self.run_state
    }

    /// Status tokens of the current (or last) run of `kind`.
    pub fn run_state_snapshot(&self, kind: &str) -> BTreeMap<String, String> {
        self.run_state.snapshot(kind)
    }

    /// Run a group, optionally restricted to `only`.
    pub async fn run_group(&self, kind: &str, only: Option<&[String]>) -> Result<GroupReport> {
        let sink = self.sink_for(kind)?;
        self.batch.run_group(kind, only, sink).await
    }

    /// Run one parser with `parameters` and collect up to `limit` items.
    pub async fn invoke(
        &self,
        identity: &str,
        parameters: Parameters,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let compiled = self.cache.ensure_loaded(identity).await?;
        let ctx = self.contexts.build(&compiled.record, parameters);
        let span = ctx.span();

        async move {
            let mut output = compiled.parser.init(ctx).await?;
            let mut items = Vec::new();
            while items.len() < limit {
                match output.next().await {
                    Some(item) => items.push(item?),
                    None => break,
                }
            }
            Ok::<_, Error>(items)
        }
        .instrument(span)
        .await
    }

    /// Sync protocol pull.
    pub async fn pull(&self, known_hashes: &[String]) -> Result<Vec<ParserDocument>> {
        self.sync.pull(known_hashes).await
    }

    /// Sync protocol push.
    pub async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        self.sync.push(request).await
    }

    /// Continuous runner for this engine's continuous kind.
    pub fn continuous_runner(&self) -> Result<ContinuousRunner> {
        let sink = self.sink_for(&self.continuous_kind)?;
        Ok(ContinuousRunner::new(
            self.contexts.clone(),
            sink,
            self.continuous_kind.clone(),
        ))
    }

    /// Start the supervised continuous runner process, if one is configured.
    pub async fn start_continuous(&self) -> Result<()> {
        match &self.supervisor {
            Some(supervisor) => supervisor.start().await,
            None => Ok(()),
        }
    }

    /// Stop the background subscribers and the continuous runner.
    pub async fn shutdown(self) {
        info!("Engine shutting down...");

        if let Some(listener) = self.listener {
            listener.shutdown().await;
        }
        if let Some(watcher) = self.watcher {
            watcher.shutdown().await;
        }
        if let Some(supervisor) = &self.supervisor
            && let Err(e) = supervisor.shutdown().await
        {
            error!(error = %e, "Failed to stop continuous runner");
        }

        info!("Engine shutdown complete");
    }

    fn sink_for(&self, kind: &str) -> Result<Arc<dyn GroupSink>> {
        self.sinks
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::InvalidRequest(format!("no sink registered for '{}'", kind)))
    }
}
