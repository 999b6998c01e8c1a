//! NATS pub/sub transport.
//!
//! Channel names map one-to-one onto NATS subjects.

use async_trait::async_trait;
use futures::StreamExt as _;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::transport::{Envelope, MessageStream, PubSubTransport};

/// Pub/sub over a NATS server.
pub struct NatsTransport {
    client: async_nats::Client,
}

impl std::fmt::Debug for NatsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsTransport")
            .field("state", &self.client.connection_state())
            .finish()
    }
}

impl NatsTransport {
    /// Connect to a NATS server.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the connection cannot be
    /// established.
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BridgeError::Transport(format!("failed to connect to NATS: {e}")))?;
        info!("NATS connection established");
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub const fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PubSubTransport for NatsTransport {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), BridgeError> {
        self.client
            .publish(channel.to_owned(), payload.into())
            .await
            .map_err(|e| BridgeError::Transport(format!("failed to publish to {channel}: {e}")))?;
        debug!(channel, "NATS publish");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, BridgeError> {
        let mut subscribers = Vec::with_capacity(channels.len());
        for channel in channels {
            let subscriber = self.client.subscribe(channel.clone()).await.map_err(|e| {
                BridgeError::Transport(format!("failed to subscribe to {channel}: {e}"))
            })?;
            subscribers.push(subscriber);
        }
        let merged = futures::stream::select_all(subscribers).map(|msg| Envelope {
            channel: msg.subject.to_string(),
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
        });
        Ok(Box::pin(merged))
    }

    async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            debug!(error = %e, "NATS flush on close failed");
        }
    }
}
