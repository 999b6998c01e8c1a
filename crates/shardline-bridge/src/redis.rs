//! Redis/`Dragonfly` pub/sub transport.
//!
//! A connection in subscriber mode cannot publish, so the transport holds
//! two [`fred`] clients: one for `PUBLISH`, one for `SUBSCRIBE`.

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::Message;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::transport::{Envelope, MessageStream, PubSubTransport, receiver_stream};

/// Pub/sub over a Redis-compatible server.
pub struct RedisTransport {
    publisher: Client,
    subscriber: Client,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("publisher_connected", &self.publisher.is_connected())
            .field("subscriber_connected", &self.subscriber.is_connected())
            .finish()
    }
}

impl RedisTransport {
    /// Connect both clients to `url` (`redis://host:port`).
    ///
    /// The URL is not logged; callers log a redacted form.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the URL is invalid or either
    /// connection fails.
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let config = Config::from_url(url)
            .map_err(|e| BridgeError::Transport(format!("Invalid pub/sub URL: {e}")))?;
        let publisher = Builder::from_config(config.clone()).build()?;
        let subscriber = Builder::from_config(config).build()?;
        publisher.init().await?;
        subscriber.init().await?;

        info!("Connected to Redis pub/sub");
        Ok(Self {
            publisher,
            subscriber,
        })
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), BridgeError> {
        let receivers: i64 = self.publisher.publish(channel, payload).await?;
        debug!(channel, receivers, "PUBLISH");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, BridgeError> {
        // Take the receiver first so nothing published after SUBSCRIBE is missed.
        let rx = self.subscriber.message_rx();
        self.subscriber.subscribe(channels.to_vec()).await?;
        Ok(receiver_stream(rx, |message: Message| {
            let payload = message.value.as_string()?;
            Some(Envelope {
                channel: message.channel.to_string(),
                payload,
            })
        }))
    }

    async fn close(&self) {
        for client in [&self.subscriber, &self.publisher] {
            if let Err(e) = client.quit().await {
                debug!(error = %e, "error while closing pub/sub connection");
            }
        }
    }
}
