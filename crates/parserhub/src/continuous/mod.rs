// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Continuous runner.
//!
//! Long-running parsers live in a dedicated process. On start it loads every
//! enabled, continuous parser of one kind and runs each exactly once, with no
//! parameters, feeding the same kind of sink as a scheduled group. With none
//! to run it returns immediately.
//!
//! The process is managed from the host process through a
//! [`ContinuousSupervisor`]. A push that changes the set of continuous
//! parsers restarts it, whichever process applied the push (see
//! [`ContinuousWatcher`]); a process that exits on its own stays down.

pub mod supervisor;
pub mod watcher;

pub use self::supervisor::{ContinuousSupervisor, ProcessSupervisor};
pub use self::watcher::ContinuousWatcher;

use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};

use crate::batch::{GroupReport, execute_root};
use crate::context::ContextBuilder;
use crate::error::{Result, error_trace};
use crate::sink::GroupSink;

/// Runs every continuous parser of a kind once.
pub struct ContinuousRunner {
    contexts: ContextBuilder,
    sink: Arc<dyn GroupSink>,
    kind: String,
}

impl ContinuousRunner {
    /// Create a runner for continuous parsers of `kind`.
    pub fn new(
        contexts: ContextBuilder,
        sink: Arc<dyn GroupSink>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            contexts,
            sink,
            kind: kind.into(),
        }
    }

    /// Kind scanned for continuous parsers.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Start every continuous parser and wait until all of them finished.
    pub async fn run(&self) -> Result<GroupReport> {
        let records = self
            .contexts
            .cache()
            .store()
            .list_continuous(&self.kind)
            .await?;

        let mut report = GroupReport {
            kind: self.kind.clone(),
            ..Default::default()
        };
        if records.is_empty() {
            info!(kind = %self.kind, "No continuous parsers, exiting");
            return Ok(report);
        }

        let identities: Vec<String> = records.iter().map(|r| r.identity.clone()).collect();
        let load = self.contexts.cache().ensure_loaded_many(&identities).await?;
        info!(kind = %self.kind, count = identities.len(), "Starting continuous parsers");

        let outcomes = join_all(identities.iter().map(|identity| async {
            let outcome = execute_root(
                &self.contexts,
                identity,
                &load,
                self.sink.as_ref(),
                |_| {},
            )
            .await;
            (identity.clone(), outcome)
        }))
        .await;

        self.sink.flush().await;

        for (identity, outcome) in outcomes {
            match outcome {
                Ok(count) => {
                    info!(identity = %identity, count, "Continuous parser finished");
                    report.total += count;
                    report.counts.insert(identity, count);
                }
                Err(e) => {
                    let trace = error_trace(&e);
                    error!(identity = %identity, error = %trace, "Continuous parser failed");
                    report.counts.insert(identity.clone(), 0);
                    report.failed.insert(identity, trace);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ParserCache;
    use crate::context::ExecutionContext;
    use crate::plugin::PluginRegistry;
    use crate::record::{ParserRecord, PartialParserRecord};
    use crate::store::{ParserStore, SqliteParserStore};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink(AtomicUsize);

    #[async_trait]
    impl GroupSink for CountingSink {
        async fn on_item(&self, _ctx: &ExecutionContext, _identity: &str, _item: Value) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn parser(identity: &str, continuous: bool, disabled: bool) -> ParserRecord {
        PartialParserRecord {
            identity: identity.to_string(),
            provide: Vec::new(),
            storage_keys: Vec::new(),
            disabled,
            visibility: Default::default(),
            continuous,
            code: r#"{"plugin":"static","options":{"items":[1,2]}}"#.to_string(),
            source: None,
        }
        .into_record()
        .unwrap()
    }

    async fn runner(records: Vec<ParserRecord>, sink: Arc<CountingSink>) -> ContinuousRunner {
        let store = SqliteParserStore::in_memory().await.unwrap();
        store.upsert(&records, 10).await.unwrap();
        let cache = Arc::new(ParserCache::new(
            Arc::new(store),
            Arc::new(PluginRegistry::with_builtins()),
        ));
        ContinuousRunner::new(ContextBuilder::new(cache), sink, "importers")
    }

    #[tokio::test]
    async fn test_runs_only_enabled_continuous_parsers() {
        let sink = Arc::new(CountingSink::default());
        let runner = runner(
            vec![
                parser("importers/live", true, false),
                parser("importers/off", true, true),
                parser("importers/batch", false, false),
            ],
            sink.clone(),
        )
        .await;

        let report = runner.run().await.unwrap();
        assert_eq!(report.counts.len(), 1);
        assert_eq!(report.counts["importers/live"], 2);
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_returns_immediately_without_continuous_parsers() {
        let sink = Arc::new(CountingSink::default());
        let runner = runner(vec![parser("importers/batch", false, false)], sink.clone()).await;

        let report = runner.run().await.unwrap();
        assert!(report.counts.is_empty());
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);
    }
}
