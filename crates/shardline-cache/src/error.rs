//! Error types for the cache layer.
//!
//! [`CacheError`] is returned by the external cache capability. The hybrid
//! cache itself rarely surfaces these: most external failures are logged and
//! answered from the in-memory fallback instead.

/// Errors that can occur in the cache layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Could not connect to the external cache.
    #[error("cache connection error: {0}")]
    Connection(String),

    /// The external cache rejected or failed a command.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// A value could not be (de)serialized.
    #[error("cache serialization error: {0}")]
    Serialization(String),

    /// The external cache is not connected (or not configured).
    #[error("external cache is not connected")]
    Disconnected,
}

impl From<fred::error::Error> for CacheError {
    fn from(err: fred::error::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
