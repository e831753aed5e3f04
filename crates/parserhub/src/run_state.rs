// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-flight run state per group kind.
//!
//! Each kind has at most one run in flight per process. While it runs, every
//! selected parser carries a [`RunStatus`]; the control surface reads them
//! as status tokens through [`RunStateRegistry::snapshot`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{Error, Result};

/// Status of one parser in a group run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Selected, not started yet.
    Waiting,
    /// Building its context and initializing.
    Preparing,
    /// Producing output; accepted items so far.
    Running(u64),
    /// Output exhausted; accepted items in total.
    Finished(u64),
    /// Failed; rendered error trace.
    Error(String),
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Waiting => write!(f, "waiting"),
            RunStatus::Preparing => write!(f, "preparing"),
            RunStatus::Running(count) => write!(f, "running|{}", count),
            RunStatus::Finished(count) => write!(f, "finished|{}", count),
            RunStatus::Error(trace) => write!(f, "error\n{}", trace),
        }
    }
}

#[derive(Debug, Default)]
struct KindState {
    active: bool,
    statuses: HashMap<String, RunStatus>,
}

/// Shared registry of run states, keyed by kind.
#[derive(Debug, Clone, Default)]
pub struct RunStateRegistry {
    kinds: Arc<DashMap<String, KindState>>,
}

impl RunStateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `kind` as in flight, replacing the statuses of its previous run.
    ///
    /// Fails when a run for `kind` is already in flight. The returned guard
    /// marks the run as finished when dropped.
    pub fn begin(&self, kind: &str) -> Result<RunGuard> {
        match self.kinds.entry(kind.to_string()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if state.active {
                    return Err(Error::InvalidRequest(format!(
                        "a run for '{}' is already in progress",
                        kind
                    )));
                }
                state.active = true;
                state.statuses.clear();
            }
            Entry::Vacant(entry) => {
                entry.insert(KindState {
                    active: true,
                    statuses: HashMap::new(),
                });
            }
        }

        Ok(RunGuard {
            registry: self.clone(),
            kind: kind.to_string(),
        })
    }

    /// Whether a run for `kind` is in flight.
    pub fn is_running(&self, kind: &str) -> bool {
        self.kinds.get(kind).is_some_and(|state| state.active)
    }

    /// Status of one parser.
    pub fn status(&self, kind: &str, identity: &str) -> Option<RunStatus> {
        self.kinds
            .get(kind)
            .and_then(|state| state.statuses.get(identity).cloned())
    }

    /// Status tokens of the current (or last) run of `kind`.
    pub fn snapshot(&self, kind: &str) -> BTreeMap<String, String> {
        self.kinds
            .get(kind)
            .map(|state| {
                state
                    .statuses
                    .iter()
                    .map(|(identity, status)| (identity.clone(), status.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set(&self, kind: &str, identity: &str, status: RunStatus) {
        if let Some(mut state) = self.kinds.get_mut(kind) {
            state.statuses.insert(identity.to_string(), status);
        }
    }

    fn end(&self, kind: &str) {
        if let Some(mut state) = self.kinds.get_mut(kind) {
            state.active = false;
        }
    }
}

/// Marks a kind as in flight for as long as it lives.
#[derive(Debug)]
pub struct RunGuard {
    registry: RunStateRegistry,
    kind: String,
}

impl RunGuard {
    /// The kind this run belongs to.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Set the status of one parser in this run.
    pub fn set(&self, identity: &str, status: RunStatus) {
        self.registry.set(&self.kind, identity, status);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.end(&self.kind);
    }
}
