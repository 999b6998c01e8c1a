//! The external cache capability.
//!
//! [`HybridCache`](crate::hybrid::HybridCache) talks to its external store
//! through [`ExternalCache`]. Which implementation is used is decided once,
//! from configuration, at startup:
//!
//! - [`DragonflyCache`](crate::dragonfly::DragonflyCache) when a cache URL is
//!   configured and reachable;
//! - [`NullCache`] otherwise, which reports itself disconnected so every
//!   operation is served from the in-memory fallback.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

/// Result of an atomic windowed increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment.
    pub count: u64,
    /// Time until the window (the key) expires.
    pub reset_in: Duration,
}

/// Key-value operations with `GET`/`SETEX`/`DEL`/`INCR`/`MULTI` semantics.
#[async_trait]
pub trait ExternalCache: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Whether the connection is currently up.
    fn is_connected(&self) -> bool;

    /// Read a raw string value.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a value with a TTL (`SETEX`).
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Delete one key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Delete every key matching a glob pattern. Returns the number deleted.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError>;

    /// Increment `key` and start a `window`-long expiry if the key is new,
    /// in a single round trip.
    async fn incr_with_expiry(&self, key: &str, window: Duration)
    -> Result<WindowCount, CacheError>;

    /// Round-trip check.
    async fn ping(&self) -> Result<(), CacheError>;
}

/// The "no external cache" capability.
///
/// Always disconnected; every call fails with [`CacheError::Disconnected`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

#[async_trait]
impl ExternalCache for NullCache {
    fn name(&self) -> &'static str {
        "null"
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Disconnected)
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Disconnected)
    }

    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Err(CacheError::Disconnected)
    }

    async fn delete_pattern(&self, _pattern: &str) -> Result<u64, CacheError> {
        Err(CacheError::Disconnected)
    }

    async fn incr_with_expiry(
        &self,
        _key: &str,
        _window: Duration,
    ) -> Result<WindowCount, CacheError> {
        Err(CacheError::Disconnected)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Err(CacheError::Disconnected)
    }
}
