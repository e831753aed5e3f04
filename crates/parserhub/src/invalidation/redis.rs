// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis (or Valkey) pub/sub invalidation bus.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use super::{InvalidationBus, InvalidationMessage, MessageStream, decode};
use crate::error::Result;

/// Invalidation bus over a Redis pub/sub channel.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
    channel: String,
}

impl RedisBus {
    /// Connect to `url` and use `channel` for invalidations.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            publisher,
            channel: channel.into(),
        })
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl InvalidationBus for RedisBus {
    async fn publish(&self, message: &InvalidationMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(&self.channel, payload).await?;
        debug!(channel = %self.channel, receivers, "Published invalidation");
        Ok(())
    }

    async fn subscribe(&self) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => decode(&payload),
                Err(e) => {
                    warn!(error = %e, "Ignoring non-text invalidation payload");
                    None
                }
            }
        });

        Ok(messages.boxed())
    }
}
