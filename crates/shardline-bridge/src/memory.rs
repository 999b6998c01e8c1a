//! In-process pub/sub bus.
//!
//! Clones of a [`MemoryTransport`] share one bus, so several bridges in the
//! same process behave like shards on a real broker.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BridgeError;
use crate::transport::{Envelope, MessageStream, PubSubTransport, receiver_stream};

/// Messages buffered per subscriber before it starts lagging.
const DEFAULT_CAPACITY: usize = 1024;

/// Shared in-memory bus.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    bus: broadcast::Sender<Envelope>,
}

impl MemoryTransport {
    /// A new, empty bus.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A bus buffering `capacity` messages per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self { bus }
    }

    /// Active subscriptions on the bus.
    pub fn subscriber_count(&self) -> usize {
        self.bus.receiver_count()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), BridgeError> {
        // No subscribers is not an error: the message is simply lost.
        let _ = self.bus.send(Envelope {
            channel: channel.to_owned(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, BridgeError> {
        let wanted = channels.to_vec();
        Ok(receiver_stream(self.bus.subscribe(), move |envelope: Envelope| {
            wanted.contains(&envelope.channel).then_some(envelope)
        }))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn subscribers_only_see_their_channels() {
        let bus = MemoryTransport::new();
        let mut stream = bus.subscribe(&["a".to_owned()]).await.unwrap_or_else(|_| {
            Box::pin(futures::stream::empty())
        });
        bus.publish("b", "ignored".to_owned()).await.unwrap_or_default();
        bus.publish("a", "seen".to_owned()).await.unwrap_or_default();

        let first = stream.next().await;
        assert_eq!(first.map(|e| e.payload), Some("seen".to_owned()));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = MemoryTransport::new();
        assert!(bus.publish("a", "lost".to_owned()).await.is_ok());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn clones_share_the_bus() {
        let bus = MemoryTransport::new();
        let other = bus.clone();
        let mut stream = other.subscribe(&["x".to_owned()]).await.unwrap_or_else(|_| {
            Box::pin(futures::stream::empty())
        });
        bus.publish("x", "hi".to_owned()).await.unwrap_or_default();
        assert_eq!(stream.next().await.map(|e| e.channel), Some("x".to_owned()));
    }
}
