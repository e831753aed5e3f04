// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restarts the supervised continuous runner when continuous parsers change.
//!
//! Pushes may be applied by any process, so the host learns about them from
//! the invalidation channel rather than from its own push path. A message
//! naming an identity that was continuous before, or is continuous now,
//! triggers a restart. After a lost subscription the continuous set is
//! compared with the last one seen and the runner restarted if it differs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::ContinuousSupervisor;
use crate::error::Result;
use crate::invalidation::{
    DEFAULT_RESUBSCRIBE_DELAY, InvalidationBus, ListenerHandle, MessageStream, resubscribe,
};
use crate::record::kind_of;
use crate::store::ParserStore;

/// Identity to hash of every enabled continuous parser of one kind.
type ContinuousSet = HashMap<String, String>;

/// Watches the invalidation channel on behalf of a [`ContinuousSupervisor`].
pub struct ContinuousWatcher {
    bus: Arc<dyn InvalidationBus>,
    store: Arc<dyn ParserStore>,
    supervisor: Arc<dyn ContinuousSupervisor>,
    kind: String,
    resubscribe_delay: Duration,
    shutdown: Arc<Notify>,
}

impl ContinuousWatcher {
    /// Watch continuous parsers of `kind`.
    pub fn new(
        bus: Arc<dyn InvalidationBus>,
        store: Arc<dyn ParserStore>,
        supervisor: Arc<dyn ContinuousSupervisor>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            store,
            supervisor,
            kind: kind.into(),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Set the delay between subscription attempts.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Subscribe, take the first snapshot, then watch in a background task.
    pub async fn spawn(self) -> Result<ListenerHandle> {
        let stream = self.bus.subscribe().await?;
        let known = self.snapshot().await?;
        info!(kind = %self.kind, continuous = known.len(), "Continuous watcher subscribed");

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move { self.run(stream, known).await });

        Ok(ListenerHandle::new(handle, shutdown))
    }

    async fn snapshot(&self) -> Result<ContinuousSet> {
        Ok(self
            .store
            .list_continuous(&self.kind)
            .await?
            .into_iter()
            .map(|record| (record.identity, record.hash))
            .collect())
    }

    async fn run(self, mut stream: MessageStream, mut known: ContinuousSet) {
        loop {
            loop {
                tokio::select! {
                    biased;

                    _ = self.shutdown.notified() => {
                        info!("Continuous watcher received shutdown signal");
                        return;
                    }

                    message = stream.next() => match message {
                        Some(message) => known = self.apply(message.identities(), known).await,
                        None => {
                            warn!("Continuous watcher subscription ended");
                            break;
                        }
                    }
                }
            }

            let resubscribed =
                resubscribe(self.bus.as_ref(), self.resubscribe_delay, &self.shutdown).await;
            stream = match resubscribed {
                Some(stream) => stream,
                None => return,
            };

            // Pushes may have been missed while disconnected.
            match self.snapshot().await {
                Ok(current) => {
                    if current != known {
                        self.restart("continuous set changed while disconnected").await;
                    }
                    known = current;
                }
                Err(e) => error!(error = %e, "Failed to list continuous parsers"),
            }
        }
    }

    async fn apply(&self, identities: &[String], known: ContinuousSet) -> ContinuousSet {
        let relevant: Vec<&String> = identities
            .iter()
            .filter(|identity| kind_of(identity) == Some(self.kind.as_str()))
            .collect();
        if relevant.is_empty() {
            return known;
        }

        let current = match self.snapshot().await {
            Ok(current) => current,
            Err(e) => {
                error!(error = %e, "Failed to list continuous parsers");
                if relevant.iter().any(|identity| known.contains_key(*identity)) {
                    self.restart("continuous parser changed").await;
                }
                return known;
            }
        };

        let touched = relevant
            .iter()
            .any(|identity| known.contains_key(*identity) || current.contains_key(*identity));
        if touched {
            self.restart("continuous parser changed").await;
        } else {
            debug!(count = relevant.len(), "Invalidation touched no continuous parser");
        }
        current
    }

    async fn restart(&self, reason: &str) {
        info!(kind = %self.kind, reason, "Restarting continuous runner");
        if let Err(e) = self.supervisor.restart().await {
            error!(error = %e, "Failed to restart continuous runner");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::{InvalidationMessage, LocalBus};
    use crate::record::{ParserRecord, PartialParserRecord};
    use crate::store::SqliteParserStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingSupervisor(AtomicU64);

    #[async_trait]
    impl ContinuousSupervisor for CountingSupervisor {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn restart(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn restarts(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn parser(identity: &str, continuous: bool) -> ParserRecord {
        PartialParserRecord {
            identity: identity.to_string(),
            provide: Vec::new(),
            storage_keys: Vec::new(),
            disabled: false,
            visibility: Default::default(),
            continuous,
            code: r#"{"plugin":"static","options":{"items":[]}}"#.to_string(),
            source: None,
        }
        .into_record()
        .unwrap()
    }

    async fn eventually(supervisor: &CountingSupervisor, restarts: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while supervisor.restarts() < restarts {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("runner was not restarted");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.restarts(), restarts);
    }

    #[tokio::test]
    async fn test_missed_change_is_caught_on_resubscribe() {
        let store = Arc::new(SqliteParserStore::in_memory().await.unwrap());
        let bus = Arc::new(LocalBus::new(1));
        let supervisor = Arc::new(CountingSupervisor::default());

        let handle = ContinuousWatcher::new(
            bus.clone(),
            store.clone(),
            supervisor.clone(),
            "importers",
        )
        .with_resubscribe_delay(Duration::from_millis(10))
        .spawn()
        .await
        .unwrap();

        // Written without an announcement, then the subscriber lags
        store
            .upsert(&[parser("importers/stream", true)], 10)
            .await
            .unwrap();
        for i in 0..10 {
            bus.publish(&InvalidationMessage::invalidate(vec![format!(
                "cleaners/none-{}",
                i
            )]))
            .await
            .unwrap();
        }

        eventually(&supervisor, 1).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_other_kinds_never_restart() {
        let store = Arc::new(SqliteParserStore::in_memory().await.unwrap());
        store
            .upsert(&[parser("cleaners/stream", true)], 10)
            .await
            .unwrap();
        let bus = Arc::new(LocalBus::default());
        let supervisor = Arc::new(CountingSupervisor::default());

        let handle = ContinuousWatcher::new(
            bus.clone(),
            store.clone(),
            supervisor.clone(),
            "importers",
        )
        .spawn()
        .await
        .unwrap();

        bus.publish(&InvalidationMessage::invalidate(vec![
            "cleaners/stream".to_string(),
        ]))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.restarts(), 0);

        handle.shutdown().await;
    }
}
