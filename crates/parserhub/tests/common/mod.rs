// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for parserhub integration tests.
//!
//! Everything runs against the SQLite store on `sqlite::memory:` and the
//! in-process invalidation bus unless a test says otherwise.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde_json::{Value, json};

use parserhub::context::ExecutionContext;
use parserhub::continuous::ContinuousSupervisor;
use parserhub::error::{Error, Result};
use parserhub::plugin::{OutputStream, Parser, ParserError};
use parserhub::record::{ParserRecord, PartialParserRecord};
use parserhub::sink::{ImportItem, ImportTarget};
use parserhub::store::{ParserStore, SqliteParserStore};

/// Skip test if the PostgreSQL test database is not configured
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_PARSERHUB_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_PARSERHUB_DATABASE_URL not set");
            return;
        }
    };
}

/// An upload with no dependencies.
pub fn upload(identity: &str, code: Value) -> PartialParserRecord {
    upload_with(identity, &[], code)
}

/// An upload declaring `provide`.
pub fn upload_with(identity: &str, provide: &[&str], code: Value) -> PartialParserRecord {
    PartialParserRecord {
        identity: identity.to_string(),
        provide: provide.iter().map(|s| s.to_string()).collect(),
        storage_keys: Vec::new(),
        disabled: false,
        visibility: Default::default(),
        continuous: false,
        code: code.to_string(),
        source: None,
    }
}

/// A stored record built from an upload.
pub fn record(identity: &str, provide: &[&str], code: Value) -> ParserRecord {
    upload_with(identity, provide, code).into_record().unwrap()
}

/// Manifest of a `static` parser yielding `items`.
pub fn static_code(items: Value) -> Value {
    json!({"plugin": "static", "options": {"items": items}})
}

/// Manifest of a `fail` parser.
pub fn fail_code(message: &str) -> Value {
    json!({"plugin": "fail", "options": {"message": message}})
}

/// `n` well-formed import items.
pub fn import_items(n: usize) -> Value {
    Value::Array(
        (0..n)
            .map(|i| {
                json!({
                    "url": format!("https://example.com/{}", i),
                    "title": format!("Item {}", i),
                })
            })
            .collect(),
    )
}

/// Fresh in-memory store.
pub async fn sqlite_store() -> SqliteParserStore {
    SqliteParserStore::in_memory().await.unwrap()
}

/// Store wrapper counting closure fetches and optionally failing writes.
pub struct CountingStore {
    inner: Arc<dyn ParserStore>,
    closure_fetches: AtomicUsize,
    fail_writes: AtomicBool,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn ParserStore>) -> Self {
        Self {
            inner,
            closure_fetches: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn closure_fetches(&self) -> usize {
        self.closure_fetches.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StoreWrite(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl ParserStore for CountingStore {
    async fn get(&self, identity: &str) -> Result<Option<ParserRecord>> {
        self.inner.get(identity).await
    }

    async fn get_many(&self, identities: &[String]) -> Result<Vec<ParserRecord>> {
        self.inner.get_many(identities).await
    }

    async fn fetch_closure(
        &self,
        roots: &[String],
        exclude: &[String],
    ) -> Result<Vec<ParserRecord>> {
        self.closure_fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_closure(roots, exclude).await
    }

    async fn list_group(&self, kind: &str, only: Option<&[String]>) -> Result<Vec<ParserRecord>> {
        self.inner.list_group(kind, only).await
    }

    async fn list_continuous(&self, kind: &str) -> Result<Vec<ParserRecord>> {
        self.inner.list_continuous(kind).await
    }

    async fn list_all(&self) -> Result<Vec<ParserRecord>> {
        self.inner.list_all().await
    }

    async fn list_changed(&self, known_hashes: &[String]) -> Result<Vec<ParserRecord>> {
        self.inner.list_changed(known_hashes).await
    }

    async fn upsert(&self, records: &[ParserRecord], batch_size: usize) -> Result<()> {
        self.check_write()?;
        self.inner.upsert(records, batch_size).await
    }

    async fn delete(&self, identities: &[String]) -> Result<Vec<String>> {
        self.check_write()?;
        self.inner.delete(identities).await
    }
}

/// Import target remembering everything it received.
#[derive(Default)]
pub struct RecordingTarget {
    items: Mutex<Vec<(String, ImportItem)>>,
}

impl RecordingTarget {
    pub fn items(&self) -> Vec<(String, ImportItem)> {
        self.items.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImportTarget for RecordingTarget {
    async fn import(&self, identity: &str, item: ImportItem) -> Result<()> {
        self.items.lock().unwrap().push((identity.to_string(), item));
        Ok(())
    }
}

/// Supervisor that only counts calls.
#[derive(Default)]
pub struct RecordingSupervisor {
    starts: AtomicU64,
    restarts: AtomicU64,
}

impl RecordingSupervisor {
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContinuousSupervisor for RecordingSupervisor {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }
}

/// Tracks how many parsers are mid-execution at once.
#[derive(Default)]
pub struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Parser that holds its slot for `delay`, then yields one import item.
pub struct DelayParser {
    gauge: Arc<Gauge>,
    delay: Duration,
}

impl DelayParser {
    /// Factory for a `delay` plugin with `{"ms": n}` options sharing `gauge`.
    pub fn factory(
        gauge: Arc<Gauge>,
    ) -> impl Fn(&Value) -> std::result::Result<Arc<dyn Parser>, ParserError> + Send + Sync + 'static
    {
        move |options: &Value| {
            let ms = options.get("ms").and_then(Value::as_u64).unwrap_or(50);
            Ok(Arc::new(DelayParser {
                gauge: gauge.clone(),
                delay: Duration::from_millis(ms),
            }) as Arc<dyn Parser>)
        }
    }
}

#[async_trait]
impl Parser for DelayParser {
    async fn init(&self, ctx: ExecutionContext) -> std::result::Result<OutputStream, ParserError> {
        let active = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
        self.gauge.finished.fetch_add(1, Ordering::SeqCst);

        let item = json!({
            "url": format!("https://example.com/{}", ctx.identity()),
            "title": "delayed",
        });
        Ok(stream::iter(vec![Ok(item)]).boxed())
    }
}
