//! Error types for the shard bridge.

/// Errors that can occur in the shard bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The pub/sub transport failed to connect, publish, or subscribe.
    #[error("pub/sub transport error: {0}")]
    Transport(String),

    /// A message envelope could not be encoded or decoded.
    #[error("message serialization error: {0}")]
    Serialization(String),

    /// A request handler failed.
    #[error("handler for '{kind}' failed: {message}")]
    Handler {
        /// Request type the handler was registered for.
        kind: String,
        /// Failure description.
        message: String,
    },

    /// The bridge has been shut down.
    #[error("shard bridge is shut down")]
    Closed,
}

impl From<fred::error::Error> for BridgeError {
    fn from(err: fred::error::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
