//! External cache with an in-memory fallback.
//!
//! Every write goes to both stores. Reads prefer the external cache and use
//! the local copy only when the external lookup fails or the external cache
//! is disconnected. An external miss is a miss: the local copy is not
//! consulted, so a key deleted by another shard does not resurface here.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::external::{ExternalCache, NullCache};
use crate::fallback::FallbackStore;

/// Default fallback capacity.
pub const DEFAULT_MAX_FALLBACK_ENTRIES: usize = 10_000;

/// Default TTL for [`HybridCache::set`] without an explicit TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Shortest sweep period the sweeper accepts.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries in the fallback map, including expired ones not yet swept.
    pub fallback_entries: usize,
    /// Fallback capacity.
    pub max_entries: usize,
    /// Whether the external cache is currently connected.
    pub external_connected: bool,
    /// Name of the external provider.
    pub external: &'static str,
}

/// External cache plus bounded local fallback.
pub struct HybridCache {
    external: Arc<dyn ExternalCache>,
    fallback: Mutex<FallbackStore>,
    default_ttl: Duration,
}

impl std::fmt::Debug for HybridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridCache")
            .field("external", &self.external.name())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl HybridCache {
    /// Create a cache over `external` with a fallback of `max_entries`.
    pub fn new(external: Arc<dyn ExternalCache>, max_entries: usize) -> Self {
        Self {
            external,
            fallback: Mutex::new(FallbackStore::new(max_entries)),
            default_ttl: DEFAULT_TTL,
        }
    }

    /// A cache with no external store.
    pub fn local_only(max_entries: usize) -> Self {
        Self::new(Arc::new(NullCache), max_entries)
    }

    /// Set the TTL used when none is given.
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// The external capability.
    pub fn external(&self) -> &Arc<dyn ExternalCache> {
        &self.external
    }

    pub(crate) fn store(&self) -> MutexGuard<'_, FallbackStore> {
        self.fallback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Core operations
    // =========================================================================

    /// Read the raw value at `key`.
    pub async fn get(&self, key: &str) -> Option<String> {
        if self.external.is_connected() {
            match self.external.get(key).await {
                Ok(value) => return value,
                Err(e) => warn!(key, error = %e, "external cache read failed, using local fallback"),
            }
        }
        let value = self.store().get(key);
        debug!(key, hit = value.is_some(), "fallback GET");
        value
    }

    /// Write `value` at `key` for `ttl` (or the default TTL).
    ///
    /// The local copy is always written, so a later external outage still
    /// serves the value until it expires.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.store().insert(key, value.to_owned(), ttl);
        if self.external.is_connected()
            && let Err(e) = self.external.set_ex(key, value, ttl).await
        {
            warn!(key, error = %e, "external cache write failed, kept local copy only");
        }
    }

    /// Read and deserialize a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialization`] if the stored value is not valid
    /// JSON for `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Serialize `value` as JSON and store it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialization`] if serialization fails.
    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await;
        Ok(())
    }

    /// Delete `key` from both stores. Returns whether either held it.
    pub async fn delete(&self, key: &str) -> bool {
        let local = self.store().remove(key);
        let external = if self.external.is_connected() {
            match self.external.delete(key).await {
                Ok(existed) => existed,
                Err(e) => {
                    warn!(key, error = %e, "external cache delete failed");
                    false
                }
            }
        } else {
            false
        };
        local || external
    }

    /// Delete every key matching a glob pattern from both stores.
    ///
    /// Returns the external count when the external delete succeeded,
    /// otherwise the local count.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let local = u64::try_from(self.store().remove_matching(pattern)).unwrap_or(u64::MAX);
        if !self.external.is_connected() {
            return local;
        }
        match self.external.delete_pattern(pattern).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(pattern, error = %e, "external cache pattern delete failed");
                local
            }
        }
    }

    /// Whether `key` currently has a value.
    pub async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Remove expired fallback entries. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let removed = self.store().sweep();
        if removed > 0 {
            debug!(removed, "fallback cache sweep");
        }
        removed
    }

    /// Run [`HybridCache::sweep`] every `interval` (at least one
    /// millisecond) until the cache is dropped or the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.sweep();
            }
        })
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> CacheStats {
        let store = self.store();
        CacheStats {
            fallback_entries: store.len(),
            max_entries: store.max_entries(),
            external_connected: self.external.is_connected(),
            external: self.external.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_then_get_then_expire() {
        let cache = HybridCache::local_only(100);
        cache.set("k", "v", Some(Duration::from_secs(1))).await;
        assert_eq!(cache.get("k").await, Some("v".to_owned()));

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_clears_expired_entries() {
        let cache = HybridCache::local_only(100);
        for i in 0..5 {
            cache.set(&format!("k{i}"), "v", Some(Duration::from_secs(1))).await;
        }
        cache.set("keep", "v", None).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.sweep(), 5);
        assert_eq!(cache.stats().fallback_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_periodically() {
        let cache = Arc::new(HybridCache::local_only(100));
        cache.set("k", "v", Some(Duration::from_secs(1))).await;
        let handle = cache.spawn_sweeper(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cache.stats().fallback_entries, 0);
        handle.abort();
    }

    #[tokio::test]
    async fn json_roundtrip_and_delete() {
        let cache = HybridCache::local_only(10);
        cache
            .set_json("guild:1", &serde_json::json!({"prefix": "!"}), None)
            .await
            .unwrap_or_default();
        let value: Option<serde_json::Value> = cache.get_json("guild:1").await.unwrap_or_default();
        assert_eq!(value, Some(serde_json::json!({"prefix": "!"})));
        assert!(cache.has("guild:1").await);
        assert!(cache.delete("guild:1").await);
        assert!(!cache.has("guild:1").await);
    }

    #[tokio::test]
    async fn stats_report_null_external() {
        let cache = HybridCache::local_only(42);
        let stats = cache.stats();
        assert_eq!(stats.max_entries, 42);
        assert!(!stats.external_connected);
        assert_eq!(stats.external, "null");
    }
}
