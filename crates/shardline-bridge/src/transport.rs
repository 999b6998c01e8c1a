//! The pub/sub transport capability.
//!
//! A transport moves JSON text between named channels. Delivery is
//! best-effort: a shard that is not subscribed when a message is published
//! never sees it.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::error::BridgeError;

/// A message received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Channel the message arrived on.
    pub channel: String,
    /// JSON payload.
    pub payload: String,
}

/// Stream of messages from a subscription. Ends when the transport closes.
pub type MessageStream = BoxStream<'static, Envelope>;

/// Publish/subscribe over named channels.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BridgeError>;

    /// Subscribe to `channels`.
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, BridgeError>;

    /// Release connections. Further calls may fail.
    async fn close(&self) {}
}

/// Adapt a broadcast receiver into a [`MessageStream`], keeping only the
/// items `convert` maps to an envelope. A lagging receiver skips ahead.
pub(crate) fn receiver_stream<T, F>(rx: broadcast::Receiver<T>, convert: F) -> MessageStream
where
    T: Clone + Send + 'static,
    F: FnMut(T) -> Option<Envelope> + Send + 'static,
{
    Box::pin(stream::unfold((rx, convert), |(mut rx, mut convert)| async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    if let Some(envelope) = convert(item) {
                        return Some((envelope, (rx, convert)));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "pub/sub subscriber lagged, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }))
}
