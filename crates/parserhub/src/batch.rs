// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch runner.
//!
//! Runs one group of parsers (every enabled, non-continuous parser under a
//! kind) with a fixed upper bound on how many run at the same time. Each
//! root parser's output goes to the group's [`GroupSink`]. A parser that
//! fails, panics or yields garbage contributes zero to the report and never
//! affects its siblings.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tracing::{Instrument, debug, error, info};

use crate::cache::LoadReport;
use crate::context::{ContextBuilder, ExecutionContext, Parameters};
use crate::error::{Error, Result, error_trace};
use crate::plugin::{Parser, ParserError};
use crate::record::ParserRecord;
use crate::run_state::{RunGuard, RunStateRegistry, RunStatus};
use crate::sink::GroupSink;

/// Aggregate outcome of one group run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    /// Group kind
    pub kind: String,
    /// Accepted items per parser; failed parsers count zero
    pub counts: BTreeMap<String, u64>,
    /// Error trace per failed parser
    pub failed: BTreeMap<String, String>,
    /// Sum of `counts`
    pub total: u64,
}

/// Receives group reports. Stands in for the telemetry sinks.
#[async_trait]
pub trait StatsReporter: Send + Sync {
    /// Publish a finished run's statistics.
    async fn report(&self, report: &GroupReport);
}

/// Reporter writing group statistics to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl StatsReporter for LogReporter {
    async fn report(&self, report: &GroupReport) {
        info!(
            kind = %report.kind,
            parsers = report.counts.len(),
            failed = report.failed.len(),
            total = report.total,
            "Group run finished"
        );
        for (identity, count) in &report.counts {
            debug!(kind = %report.kind, identity = %identity, count, "Parser statistics");
        }
    }
}

/// Runs groups of parsers with bounded parallelism.
pub struct BatchRunner {
    contexts: ContextBuilder,
    run_state: RunStateRegistry,
    reporter: Arc<dyn StatsReporter>,
    concurrency: usize,
}

impl BatchRunner {
    /// Create a runner executing at most `concurrency` parsers at a time.
    pub fn new(contexts: ContextBuilder, run_state: RunStateRegistry, concurrency: usize) -> Self {
        Self {
            contexts,
            run_state,
            reporter: Arc::new(LogReporter),
            concurrency: concurrency.max(1),
        }
    }

    /// Replace the statistics reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn StatsReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Upper bound on simultaneously running parsers.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every enabled, non-continuous parser of `kind`, restricted to
    /// `only` when given, feeding their output to `sink`.
    ///
    /// Only store failures and a concurrent run of the same kind are errors;
    /// parser failures end up in the report.
    pub async fn run_group(
        &self,
        kind: &str,
        only: Option<&[String]>,
        sink: Arc<dyn GroupSink>,
    ) -> Result<GroupReport> {
        let guard = self.run_state.begin(kind)?;

        let records = self.contexts.cache().store().list_group(kind, only).await?;
        for record in &records {
            guard.set(&record.identity, RunStatus::Waiting);
        }
        info!(kind, count = records.len(), "Starting group run");

        let identities: Vec<String> = records.iter().map(|r| r.identity.clone()).collect();
        let load = self.contexts.cache().ensure_loaded_many(&identities).await?;

        let outcomes: Vec<(String, std::result::Result<u64, String>)> = stream::iter(&records)
            .map(|record| self.run_root(&guard, record, &load, sink.as_ref()))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        sink.flush().await;

        let mut report = GroupReport {
            kind: kind.to_string(),
            ..Default::default()
        };
        for (identity, outcome) in outcomes {
            match outcome {
                Ok(count) => {
                    report.total += count;
                    report.counts.insert(identity, count);
                }
                Err(trace) => {
                    report.counts.insert(identity.clone(), 0);
                    report.failed.insert(identity, trace);
                }
            }
        }

        self.reporter.report(&report).await;
        Ok(report)
    }

    async fn run_root(
        &self,
        guard: &RunGuard,
        record: &ParserRecord,
        load: &LoadReport,
        sink: &dyn GroupSink,
    ) -> (String, std::result::Result<u64, String>) {
        let identity = record.identity.clone();
        guard.set(&identity, RunStatus::Preparing);

        let progress = |count| guard.set(&identity, RunStatus::Running(count));
        match execute_root(&self.contexts, &identity, load, sink, progress).await {
            Ok(count) => {
                guard.set(&identity, RunStatus::Finished(count));
                (identity, Ok(count))
            }
            Err(e) => {
                let trace = error_trace(&e);
                error!(
                    kind = guard.kind(),
                    identity = %identity,
                    error = %trace,
                    "Parser execution failed"
                );
                guard.set(&identity, RunStatus::Error(trace.clone()));
                (identity, Err(trace))
            }
        }
    }
}

/// Run one root parser with no parameters, feeding `sink`.
///
/// The root is reloaded if it was invalidated after `load`. Compile
/// failures, missing records, parser errors and panics all come back as
/// `Err`; nothing escapes to the caller's siblings.
pub(crate) async fn execute_root<F>(
    contexts: &ContextBuilder,
    identity: &str,
    load: &LoadReport,
    sink: &dyn GroupSink,
    progress: F,
) -> Result<u64>
where
    F: Fn(u64),
{
    let compiled = match load.failed.get(identity) {
        Some(reason) if !contexts.cache().contains(identity) => {
            return Err(Error::Compile {
                identity: identity.to_string(),
                reason: reason.clone(),
            });
        }
        _ => contexts.cache().ensure_loaded(identity).await?,
    };

    let ctx = contexts.build(&compiled.record, Parameters::new());
    let span = ctx.span();

    let outcome = AssertUnwindSafe(drive(compiled.parser.as_ref(), ctx, sink, progress))
        .catch_unwind()
        .instrument(span)
        .await;

    match outcome {
        Ok(Ok(count)) => Ok(count),
        Ok(Err(e)) => Err(Error::Execution(e)),
        Err(panic) => Err(Error::Other(format!(
            "parser panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

/// Initialize a root parser and feed its output to `sink` in order.
///
/// Accepted items are added to the context's counter; `progress` sees the
/// running total. Returns the final counter value.
async fn drive<F>(
    parser: &dyn Parser,
    ctx: ExecutionContext,
    sink: &dyn GroupSink,
    progress: F,
) -> std::result::Result<u64, ParserError>
where
    F: Fn(u64),
{
    let mut output = parser.init(ctx.clone()).await?;
    progress(ctx.items());

    while let Some(item) = output.next().await {
        if sink.on_item(&ctx, ctx.identity(), item?).await {
            ctx.record_items(1);
            progress(ctx.items());
        }
    }

    Ok(ctx.items())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ParserCache;
    use crate::plugin::PluginRegistry;
    use crate::record::PartialParserRecord;
    use crate::store::{ParserStore, SqliteParserStore};
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        items: Mutex<Vec<(String, Value)>>,
        flushes: Mutex<usize>,
    }

    #[async_trait]
    impl GroupSink for RecordingSink {
        async fn on_item(&self, _ctx: &ExecutionContext, identity: &str, item: Value) -> bool {
            if item.is_null() {
                return false;
            }
            self.items.lock().unwrap().push((identity.to_string(), item));
            true
        }

        async fn flush(&self) {
            *self.flushes.lock().unwrap() += 1;
        }
    }

    fn parser(identity: &str, code: Value, disabled: bool, continuous: bool) -> ParserRecord {
        PartialParserRecord {
            identity: identity.to_string(),
            provide: Vec::new(),
            storage_keys: Vec::new(),
            disabled,
            visibility: Default::default(),
            continuous,
            code: code.to_string(),
            source: None,
        }
        .into_record()
        .unwrap()
    }

    async fn runner(records: Vec<ParserRecord>) -> (BatchRunner, RunStateRegistry) {
        let store = SqliteParserStore::in_memory().await.unwrap();
        store.upsert(&records, 10).await.unwrap();
        let cache = Arc::new(ParserCache::new(
            Arc::new(store),
            Arc::new(PluginRegistry::with_builtins()),
        ));
        let run_state = RunStateRegistry::new();
        (
            BatchRunner::new(ContextBuilder::new(cache), run_state.clone(), 2),
            run_state,
        )
    }

    fn items(values: Value) -> Value {
        serde_json::json!({"plugin": "static", "options": {"items": values}})
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (runner, run_state) = runner(vec![
            parser(
                "importers/bad",
                serde_json::json!({"plugin": "fail", "options": {"message": "boom"}}),
                false,
                false,
            ),
            parser(
                "importers/good",
                items(serde_json::json!([1, 2, 3])),
                false,
                false,
            ),
            parser(
                "importers/broken",
                serde_json::json!({"plugin": "nope"}),
                false,
                false,
            ),
        ])
        .await;
        let sink = Arc::new(RecordingSink::default());

        let report = runner.run_group("importers", None, sink.clone()).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.counts["importers/good"], 3);
        assert_eq!(report.counts["importers/bad"], 0);
        assert!(report.failed["importers/bad"].contains("boom"));
        assert!(report.failed.contains_key("importers/broken"));
        assert_eq!(sink.items.lock().unwrap().len(), 3);
        assert_eq!(*sink.flushes.lock().unwrap(), 1);

        let snapshot = run_state.snapshot("importers");
        assert_eq!(snapshot["importers/good"], "finished|3");
        assert!(snapshot["importers/bad"].starts_with("error\n"));
    }

    #[tokio::test]
    async fn test_selection_skips_disabled_continuous_and_other_kinds() {
        let (runner, _) = runner(vec![
            parser("importers/a", items(serde_json::json!([1])), false, false),
            parser("importers/b", items(serde_json::json!([1])), true, false),
            parser("importers/c", items(serde_json::json!([1])), false, true),
            parser("cleaners/d", items(serde_json::json!([1])), false, false),
            parser("importers/e", items(serde_json::json!([1, 2])), false, false),
        ])
        .await;
        let sink = Arc::new(RecordingSink::default());

        let report = runner.run_group("importers", None, sink.clone()).await.unwrap();
        assert_eq!(
            report.counts.keys().cloned().collect::<Vec<_>>(),
            vec!["importers/a".to_string(), "importers/e".to_string()]
        );

        let only = vec!["importers/e".to_string(), "importers/b".to_string()];
        let report = runner.run_group("importers", Some(&only), sink).await.unwrap();
        assert_eq!(report.counts.len(), 1);
        assert_eq!(report.total, 2);
    }

    #[tokio::test]
    async fn test_rejected_items_are_not_counted() {
        let (runner, _) = runner(vec![parser(
            "importers/a",
            items(serde_json::json!([1, null, 2])),
            false,
            false,
        )])
        .await;

        let report = runner
            .run_group("importers", None, Arc::new(RecordingSink::default()))
            .await
            .unwrap();
        assert_eq!(report.counts["importers/a"], 2);
    }

    struct PanicParser;

    #[async_trait]
    impl Parser for PanicParser {
        async fn init(
            &self,
            _ctx: ExecutionContext,
        ) -> std::result::Result<crate::plugin::OutputStream, ParserError> {
            panic!("parser blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_parser_is_contained() {
        let store = SqliteParserStore::in_memory().await.unwrap();
        store
            .upsert(
                &[
                    parser(
                        "importers/panics",
                        serde_json::json!({"plugin": "panic"}),
                        false,
                        false,
                    ),
                    parser(
                        "importers/fine",
                        items(serde_json::json!([1, 2])),
                        false,
                        false,
                    ),
                ],
                10,
            )
            .await
            .unwrap();
        let mut registry = PluginRegistry::with_builtins();
        registry.register("panic", |_: &Value| Ok(Arc::new(PanicParser) as Arc<dyn Parser>));
        let cache = Arc::new(ParserCache::new(Arc::new(store), Arc::new(registry)));
        let runner = BatchRunner::new(ContextBuilder::new(cache), RunStateRegistry::new(), 4);

        let report = runner
            .run_group("importers", None, Arc::new(RecordingSink::default()))
            .await
            .unwrap();

        assert_eq!(report.counts["importers/fine"], 2);
        assert_eq!(report.counts["importers/panics"], 0);
        assert!(report.failed["importers/panics"].contains("parser blew up"));
    }

    struct SlowParser;

    #[async_trait]
    impl Parser for SlowParser {
        async fn init(
            &self,
            _ctx: ExecutionContext,
        ) -> std::result::Result<crate::plugin::OutputStream, ParserError> {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(futures::stream::iter(vec![Ok(serde_json::json!(1))]).boxed())
        }
    }

    #[tokio::test]
    async fn test_queued_root_invalidated_mid_run_is_reloaded() {
        let store = SqliteParserStore::in_memory().await.unwrap();
        store
            .upsert(
                &[
                    parser(
                        "importers/a",
                        serde_json::json!({"plugin": "slow"}),
                        false,
                        false,
                    ),
                    parser(
                        "importers/b",
                        items(serde_json::json!([1, 2])),
                        false,
                        false,
                    ),
                ],
                10,
            )
            .await
            .unwrap();
        let mut registry = PluginRegistry::with_builtins();
        registry.register("slow", |_: &Value| Ok(Arc::new(SlowParser) as Arc<dyn Parser>));
        let cache = Arc::new(ParserCache::new(Arc::new(store), Arc::new(registry)));
        let runner = BatchRunner::new(
            ContextBuilder::new(cache.clone()),
            RunStateRegistry::new(),
            1,
        );

        let invalidate = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            assert_eq!(cache.invalidate(&["importers/b".to_string()]), 1);
        };
        let (report, ()) = tokio::join!(
            runner.run_group("importers", None, Arc::new(RecordingSink::default())),
            invalidate
        );
        let report = report.unwrap();

        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(report.counts["importers/a"], 1);
        assert_eq!(report.counts["importers/b"], 2);
        assert!(cache.contains("importers/b"));
    }

    #[test]
    fn test_panic_message() {
        let panic = std::panic::catch_unwind(|| panic!("kaboom")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "kaboom");
    }
}
