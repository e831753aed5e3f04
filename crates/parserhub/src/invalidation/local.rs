// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process invalidation bus for single-process deployments and tests.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::{InvalidationBus, InvalidationMessage, MessageStream};
use crate::error::Result;

const DEFAULT_CAPACITY: usize = 256;

/// Invalidation bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<InvalidationMessage>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    /// Create a bus buffering up to `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscriptions.
    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl InvalidationBus for LocalBus {
    async fn publish(&self, message: &InvalidationMessage) -> Result<()> {
        // No subscribers is not an error for a fire-and-forget channel.
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<MessageStream> {
        let receiver = self.sender.subscribe();

        // A lagging subscriber ends its stream so the listener resubscribes
        // and clears its cache instead of silently missing evictions.
        let messages = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(message) => Some((message, receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Invalidation subscriber lagged");
                    None
                }
                Err(RecvError::Closed) => None,
            }
        });

        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = LocalBus::default();
        let mut first = bus.subscribe().await.unwrap();
        let mut second = bus.subscribe().await.unwrap();
        assert_eq!(bus.subscribers(), 2);

        let message = InvalidationMessage::invalidate(vec!["lib/x".to_string()]);
        bus.publish(&message).await.unwrap();

        assert_eq!(first.next().await, Some(message.clone()));
        assert_eq!(second.next().await, Some(message));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_stream_ends() {
        let bus = LocalBus::new(1);
        let mut stream = bus.subscribe().await.unwrap();
        for i in 0..3 {
            bus.publish(&InvalidationMessage::invalidate(vec![format!("lib/{}", i)]))
                .await
                .unwrap();
        }
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = LocalBus::default();
        assert!(bus.publish(&InvalidationMessage::invalidate(vec![])).await.is_ok());
    }
}
