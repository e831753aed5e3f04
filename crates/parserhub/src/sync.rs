// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pull/push synchronization with authoring tools.
//!
//! Pull returns every parser whose hash the caller does not already know,
//! with its source as text. Push deletes and upserts parsers, recomputing
//! every hash, and announces the change on the invalidation channel only
//! after the write committed. A push touching continuous parsers restarts
//! the continuous runner.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::DEFAULT_UPSERT_BATCH_SIZE;
use crate::continuous::ContinuousSupervisor;
use crate::error::{Error, Result};
use crate::invalidation::{InvalidationBus, InvalidationMessage};
use crate::record::{
    ParserDocument, ParserRecord, PartialParserRecord, SOURCE_PLACEHOLDER, decompress_source,
    kind_of,
};
use crate::store::ParserStore;

/// Pull request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequest {
    /// Hashes the caller already holds
    #[serde(default)]
    pub hashes: Vec<String>,
}

/// Push request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushRequest {
    /// Parsers to insert or update
    #[serde(default)]
    pub upsert: Vec<PartialParserRecord>,
    /// Identities to delete
    #[serde(default)]
    pub delete: Vec<String>,
}

/// Push response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Stored parsers with their server-computed hashes; source omitted
    pub upserted: Vec<ParserDocument>,
    /// Identities that existed and were deleted
    pub deleted: Vec<String>,
    /// Whether this push restarted the continuous runner itself; a host
    /// watching the invalidation channel restarts it asynchronously instead
    pub restarted: bool,
}

/// The sync protocol over a store and an invalidation channel.
pub struct SyncService {
    store: Arc<dyn ParserStore>,
    bus: Arc<dyn InvalidationBus>,
    supervisor: Option<Arc<dyn ContinuousSupervisor>>,
    batch_size: usize,
}

impl SyncService {
    /// Create a service without a continuous runner to restart.
    pub fn new(store: Arc<dyn ParserStore>, bus: Arc<dyn InvalidationBus>) -> Self {
        Self {
            store,
            bus,
            supervisor: None,
            batch_size: DEFAULT_UPSERT_BATCH_SIZE,
        }
    }

    /// Restart this supervisor's runner when continuous parsers change.
    pub fn with_supervisor(mut self, supervisor: Arc<dyn ContinuousSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Rows per bulk upsert statement.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Every parser whose hash is not in `known_hashes`, source decompressed.
    pub async fn pull(&self, known_hashes: &[String]) -> Result<Vec<ParserDocument>> {
        let records = self.store.list_changed(known_hashes).await?;

        let documents: Vec<ParserDocument> = records
            .iter()
            .map(|record| {
                let source = decompress_source(&record.source).unwrap_or_else(|e| {
                    warn!(identity = %record.identity, error = %e, "Undecodable parser source");
                    String::new()
                });
                ParserDocument::from_record(record, source)
            })
            .collect();

        info!(known = known_hashes.len(), returned = documents.len(), "Pull");
        Ok(documents)
    }

    /// Apply deletes, then upserts.
    ///
    /// Store failures abort the push before anything is announced for the
    /// failed step. Publishing and restarting are best effort.
    pub async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        let upserts = dedup_upserts(request.upsert)?;
        let deletes = validate_deletes(request.delete)?;

        let touched: Vec<String> = upserts
            .iter()
            .map(|u| u.identity.clone())
            .chain(deletes.iter().cloned())
            .collect();
        let previous = self.store.get_many(&touched).await?;
        let was_continuous = previous.iter().any(|record| record.continuous);

        let deleted = self.store.delete(&deletes).await?;
        if !deleted.is_empty() {
            self.announce(deleted.clone()).await;
        }

        let records = upserts
            .into_iter()
            .map(PartialParserRecord::into_record)
            .collect::<std::io::Result<Vec<ParserRecord>>>()?;
        self.store.upsert(&records, self.batch_size).await?;
        if !records.is_empty() {
            self.announce(records.iter().map(|r| r.identity.clone()).collect())
                .await;
        }

        let is_continuous = records.iter().any(|record| record.continuous);
        let restarted = if was_continuous || is_continuous {
            self.restart_continuous().await
        } else {
            false
        };

        info!(
            upserted = records.len(),
            deleted = deleted.len(),
            restarted,
            "Push applied"
        );

        Ok(PushResponse {
            upserted: records
                .iter()
                .map(|record| ParserDocument::from_record(record, SOURCE_PLACEHOLDER.to_string()))
                .collect(),
            deleted,
            restarted,
        })
    }

    async fn announce(&self, identities: Vec<String>) {
        let count = identities.len();
        let message = InvalidationMessage::invalidate(identities);
        if let Err(e) = self.bus.publish(&message).await {
            warn!(count, error = %e, "Failed to publish invalidation");
        }
    }

    async fn restart_continuous(&self) -> bool {
        let Some(supervisor) = &self.supervisor else {
            return false;
        };
        match supervisor.restart().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to restart continuous runner");
                false
            }
        }
    }
}

/// Validate upserts and keep the last entry per identity, in first-seen order.
fn dedup_upserts(upserts: Vec<PartialParserRecord>) -> Result<Vec<PartialParserRecord>> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<PartialParserRecord> = Vec::with_capacity(upserts.len());

    for upsert in upserts {
        if kind_of(&upsert.identity).is_none() {
            return Err(Error::InvalidRequest(format!(
                "identity '{}' has no kind prefix",
                upsert.identity
            )));
        }
        if upsert.code.trim().is_empty() {
            return Err(Error::InvalidRequest(format!(
                "parser '{}' has no code",
                upsert.identity
            )));
        }
        match positions.get(&upsert.identity) {
            Some(&index) => unique[index] = upsert,
            None => {
                positions.insert(upsert.identity.clone(), unique.len());
                unique.push(upsert);
            }
        }
    }

    Ok(unique)
}

fn validate_deletes(deletes: Vec<String>) -> Result<Vec<String>> {
    let mut unique = Vec::with_capacity(deletes.len());
    for identity in deletes {
        if identity.trim().is_empty() {
            return Err(Error::InvalidRequest("empty identity in delete".to_string()));
        }
        if !unique.contains(&identity) {
            unique.push(identity);
        }
    }
    Ok(unique)
}
