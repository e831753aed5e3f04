// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-process cache invalidation.
//!
//! Writes to the parser store are followed by an [`InvalidationMessage`] on a
//! shared pub/sub channel. Every process runs an [`InvalidationListener`]
//! that evicts the named identities from its compilation cache. Delivery is
//! fire-and-forget: nobody waits for acknowledgements, and a message missed
//! while disconnected is compensated by clearing the whole cache when the
//! listener resubscribes.

pub mod local;
pub mod redis;

pub use self::local::LocalBus;
pub use self::redis::RedisBus;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ParserCache;
use crate::error::Result;

/// Delay before resubscribing after the subscription ended or failed.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Message carried on the invalidation channel.
///
/// Serialized as `{"action": "invalidate", "identities": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InvalidationMessage {
    /// Evict these identities.
    Invalidate {
        /// Identities to evict
        identities: Vec<String>,
    },
}

impl InvalidationMessage {
    /// Build an invalidation for `identities`.
    pub fn invalidate(identities: Vec<String>) -> Self {
        InvalidationMessage::Invalidate { identities }
    }

    /// Identities named by the message.
    pub fn identities(&self) -> &[String] {
        match self {
            InvalidationMessage::Invalidate { identities } => identities,
        }
    }
}

/// Stream of received messages. Ends when the subscription is lost.
pub type MessageStream = Pin<Box<dyn Stream<Item = InvalidationMessage> + Send>>;

/// A pub/sub channel carrying invalidation messages.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Publish a message. Returns once the broker accepted it.
    async fn publish(&self, message: &InvalidationMessage) -> Result<()>;

    /// Open a new subscription.
    async fn subscribe(&self) -> Result<MessageStream>;
}

/// Decode a raw payload, logging and skipping anything unrecognized.
pub(crate) fn decode(payload: &str) -> Option<InvalidationMessage> {
    match serde_json::from_str(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "Ignoring unrecognized invalidation message");
            None
        }
    }
}

/// Applies received invalidations to a compilation cache.
pub struct InvalidationListener {
    bus: Arc<dyn InvalidationBus>,
    cache: Arc<ParserCache>,
    resubscribe_delay: Duration,
    shutdown: Arc<Notify>,
}

impl InvalidationListener {
    /// Create a listener evicting from `cache`.
    pub fn new(bus: Arc<dyn InvalidationBus>, cache: Arc<ParserCache>) -> Self {
        Self {
            bus,
            cache,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Set the delay between subscription attempts.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Subscribe, then keep applying messages in a background task.
    ///
    /// The first subscription is made before returning so that no message
    /// published after `spawn` returns can be missed.
    pub async fn spawn(self) -> Result<ListenerHandle> {
        let stream = self.bus.subscribe().await?;
        info!("Invalidation listener subscribed");

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move { self.run(stream).await });

        Ok(ListenerHandle::new(handle, shutdown))
    }

    async fn run(self, mut stream: MessageStream) {
        loop {
            loop {
                tokio::select! {
                    biased;

                    _ = self.shutdown.notified() => {
                        info!("Invalidation listener received shutdown signal");
                        return;
                    }

                    message = stream.next() => match message {
                        Some(message) => {
                            let identities = message.identities();
                            let removed = self.cache.invalidate(identities);
                            debug!(requested = identities.len(), removed, "Applied invalidation");
                        }
                        None => {
                            warn!("Invalidation subscription ended");
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
            // Messages may have been missed while disconnected.
            self.cache.clear();
            info!("Invalidation listener resubscribed, cache cleared");
        }
    }
}

/// Subscribe again after `delay`, retrying until it succeeds. Returns `None`
/// once `shutdown` is notified.
pub(crate) async fn resubscribe(
    bus: &dyn InvalidationBus,
    delay: Duration,
    shutdown: &Notify,
) -> Option<MessageStream> {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => return None,

            _ = tokio::time::sleep(delay) => {
                match bus.subscribe().await {
                    Ok(stream) => return Some(stream),
                    Err(e) => error!(error = %e, "Failed to resubscribe to invalidations"),
                }
            }
        }
    }
}

/// Handle to a running background subscriber.
pub struct ListenerHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl ListenerHandle {
    pub(crate) fn new(handle: JoinHandle<()>, shutdown: Arc<Notify>) -> Self {
        Self { handle, shutdown }
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the task and wait for it.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            error!("Invalidation subscriber task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let message = InvalidationMessage::invalidate(vec!["importers/a".to_string()]);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "invalidate", "identities": ["importers/a"]})
        );
        assert_eq!(decode(&json.to_string()), Some(message));
    }

    #[test]
    fn test_decode_skips_unknown_actions() {
        assert_eq!(decode(r#"{"action":"reload","identities":[]}"#), None);
        assert_eq!(decode("not json"), None);
    }
}
