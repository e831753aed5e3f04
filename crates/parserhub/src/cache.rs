// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compilation cache.
//!
//! Per-process map from identity to compiled parser. Entries are created on
//! demand by [`ParserCache::ensure_loaded_many`], which fetches the missing
//! part of the dependency closure in one store query and compiles it, and are
//! destroyed only by [`ParserCache::invalidate`].
//!
//! Every invalidation bumps an epoch and stamps the evicted identities with it.
//! A load that started before an eviction does not publish a result for an
//! identity evicted in the meantime, so a compiled form fetched before a
//! write can never outlive the invalidation for that write.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::plugin::{Parser, PluginRegistry};
use crate::record::ParserRecord;
use crate::store::ParserStore;

/// Attempts made to publish a load that raced with invalidations.
const MAX_LOAD_ATTEMPTS: usize = 3;

/// A cache-resident parser: its record and its compiled form.
#[derive(Clone)]
pub struct CompiledParser {
    /// The record the parser was compiled from.
    pub record: Arc<ParserRecord>,
    /// The compiled parser.
    pub parser: Arc<dyn Parser>,
}

/// Outcome of a load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Identities compiled and published by this call.
    pub loaded: Vec<String>,
    /// Requested identities the store does not know.
    pub missing: Vec<String>,
    /// Identities whose code failed to compile, with the reason.
    pub failed: HashMap<String, String>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CompiledParser>,
    epoch: u64,
    cleared_at: u64,
    evicted_at: HashMap<String, u64>,
    /// Identities the store did not have as of the last load.
    absent: HashSet<String>,
}

/// Per-process compilation cache.
pub struct ParserCache {
    store: Arc<dyn ParserStore>,
    registry: Arc<PluginRegistry>,
    state: RwLock<CacheState>,
}

impl ParserCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn ParserStore>, registry: Arc<PluginRegistry>) -> Self {
        Self {
            store,
            registry,
            state: RwLock::new(CacheState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn ParserStore> {
        &self.store
    }

    /// Compiled parser for an identity, if resident.
    pub fn get(&self, identity: &str) -> Option<CompiledParser> {
        self.read().entries.get(identity).cloned()
    }

    /// Whether an identity is resident.
    pub fn contains(&self, identity: &str) -> bool {
        self.read().entries.contains_key(identity)
    }

    /// Number of resident parsers.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Make sure a single parser and its dependencies are resident.
    pub async fn ensure_loaded(&self, identity: &str) -> Result<CompiledParser> {
        let report = self.ensure_loaded_many(&[identity.to_string()]).await?;

        if let Some(compiled) = self.get(identity) {
            return Ok(compiled);
        }
        if let Some(reason) = report.failed.get(identity) {
            return Err(Error::Compile {
                identity: identity.to_string(),
                reason: reason.clone(),
            });
        }
        Err(Error::ParserNotFound(identity.to_string()))
    }

    /// Make sure every given parser and its transitive dependencies are resident.
    ///
    /// Only a store failure is an error. Unknown identities and compile
    /// failures are reported; dependents of those will see a missing
    /// dependency when they access it.
    pub async fn ensure_loaded_many(&self, identities: &[String]) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        for attempt in 1..=MAX_LOAD_ATTEMPTS {
            let (wanted, resident, epoch) = {
                let state = self.read();
                let wanted = missing_closure(identities, &state);
                let resident: Vec<String> = state.entries.keys().cloned().collect();
                (wanted, resident, state.epoch)
            };
            if wanted.is_empty() {
                break;
            }

            let fetched = self.store.fetch_closure(&wanted, &resident).await?;
            let by_identity: HashMap<&str, &ParserRecord> = fetched
                .iter()
                .map(|record| (record.identity.as_str(), record))
                .collect();

            let mut compiled = HashMap::new();
            let mut loading = HashSet::new();
            for identity in &wanted {
                self.compile_tree(
                    identity,
                    &by_identity,
                    &mut loading,
                    &mut compiled,
                    &mut report,
                );
            }

            let absent: HashSet<String> = wanted
                .iter()
                .chain(fetched.iter().flat_map(|record| record.provide.iter()))
                .filter(|id| !by_identity.contains_key(id.as_str()) && !resident.contains(*id))
                .cloned()
                .collect();

            let raced = self.publish(compiled, absent, epoch, &mut report);
            if !raced {
                break;
            }
            debug!(attempt, "Load raced with an invalidation, retrying");
        }

        report.missing = {
            let state = self.read();
            identities
                .iter()
                .filter(|id| {
                    state.absent.contains(id.as_str()) && !state.entries.contains_key(id.as_str())
                })
                .cloned()
                .collect()
        };

        if !report.loaded.is_empty() {
            debug!(count = report.loaded.len(), "Loaded parsers into cache");
        }
        Ok(report)
    }

    fn compile_tree(
        &self,
        identity: &str,
        fetched: &HashMap<&str, &ParserRecord>,
        loading: &mut HashSet<String>,
        compiled: &mut HashMap<String, CompiledParser>,
        report: &mut LoadReport,
    ) {
        if compiled.contains_key(identity)
            || report.failed.contains_key(identity)
            || self.contains(identity)
        {
            return;
        }
        let Some(record) = fetched.get(identity) else {
            debug!(identity, "Parser not in store, leaving unresolved");
            return;
        };
        if !loading.insert(identity.to_string()) {
            warn!(identity, "Dependency cycle detected while loading, breaking it");
            return;
        }

        for dependency in &record.provide {
            self.compile_tree(dependency, fetched, loading, compiled, report);
        }

        match self.registry.compile(record) {
            Ok(parser) => {
                compiled.insert(
                    identity.to_string(),
                    CompiledParser {
                        record: Arc::new((*record).clone()),
                        parser,
                    },
                );
            }
            Err(e) => {
                warn!(identity, error = %e, "Failed to compile parser");
                report.failed.insert(identity.to_string(), e.to_string());
            }
        }
    }

    /// Insert freshly compiled parsers and remember store misses, unless
    /// the identity was evicted after `epoch`. Returns true when at least
    /// one result was dropped for that reason.
    fn publish(
        &self,
        compiled: HashMap<String, CompiledParser>,
        absent: HashSet<String>,
        epoch: u64,
        report: &mut LoadReport,
    ) -> bool {
        let mut state = self.write();
        let mut raced = false;

        if state.cleared_at > epoch {
            return !compiled.is_empty() || !absent.is_empty();
        }

        for identity in absent {
            if state
                .evicted_at
                .get(&identity)
                .is_some_and(|evicted| *evicted > epoch)
            {
                raced = true;
                continue;
            }
            state.absent.insert(identity);
        }

        for (identity, parser) in compiled {
            if state
                .evicted_at
                .get(&identity)
                .is_some_and(|evicted| *evicted > epoch)
            {
                raced = true;
                continue;
            }
            if !state.entries.contains_key(&identity) {
                state.entries.insert(identity.clone(), parser);
                report.loaded.push(identity);
            }
        }

        raced
    }

    /// Drop the cached record and compiled form of each identity.
    pub fn invalidate(&self, identities: &[String]) -> usize {
        let mut state = self.write();
        state.epoch += 1;
        let epoch = state.epoch;

        let mut removed = 0;
        for identity in identities {
            if state.entries.remove(identity).is_some() {
                removed += 1;
            }
            state.absent.remove(identity);
            state.evicted_at.insert(identity.clone(), epoch);
        }

        if removed > 0 {
            info!(removed, requested = identities.len(), "Invalidated cached parsers");
        }
        removed
    }

    /// Drop every cached parser.
    pub fn clear(&self) {
        let mut state = self.write();
        state.epoch += 1;
        state.cleared_at = state.epoch;
        state.evicted_at.clear();
        state.absent.clear();
        state.entries.clear();
    }
}

/// Identities reachable from `roots` that are neither resident nor known to
/// be absent from the store, walking the `provide` lists of resident entries.
fn missing_closure(roots: &[String], state: &CacheState) -> Vec<String> {
    let mut missing = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();

    while let Some(identity) = stack.pop() {
        if !seen.insert(identity) {
            continue;
        }
        match state.entries.get(identity) {
            Some(entry) => stack.extend(entry.record.provide.iter().map(String::as_str)),
            None if state.absent.contains(identity) => {}
            None => missing.push(identity.to_string()),
        }
    }

    missing
}
