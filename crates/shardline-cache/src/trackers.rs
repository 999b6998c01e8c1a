//! Sliding-window trackers built on [`HybridCache`].
//!
//! | Key | Value | Used by |
//! |-----|-------|---------|
//! | `spam:{guild}:{user}` | counter | [`HybridCache::track_spam_message`] |
//! | `dup:{guild}:{user}` | JSON [`DuplicateTracker`] | [`HybridCache::track_duplicate_message`] |
//! | `ratelimit:{key}` | counter | [`HybridCache::track_rate_limit`] |
//!
//! Counters use the external cache's atomic increment when it is connected
//! and the fallback store's compare-and-replace otherwise. A window starts
//! with the first observation and is never extended by later ones.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::external::WindowCount;
use crate::hybrid::HybridCache;

/// Result of [`HybridCache::track_duplicate_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateResult {
    /// Consecutive identical messages in the current window.
    pub count: u64,
    /// True when this message started a new window.
    pub is_new: bool,
}

/// Result of [`HybridCache::track_rate_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Whether this call is within the limit.
    pub allowed: bool,
    /// Calls left in the window.
    pub remaining: u64,
    /// Time until the window resets.
    pub reset_in: Duration,
}

/// Stored state for duplicate-message detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateTracker {
    /// Hash of the tracked message content.
    pub content_hash: u64,
    /// Observations in this window.
    pub count: u64,
    /// Window start, Unix milliseconds.
    pub window_start_ms: i64,
}

impl DuplicateTracker {
    /// Advance the tracker with an observation of `content_hash` at `now_ms`.
    ///
    /// Returns the new tracker state, the caller-facing result, and how long
    /// the window has left.
    pub fn observe(
        previous: Option<&Self>,
        content_hash: u64,
        now_ms: i64,
        window: Duration,
    ) -> (Self, DuplicateResult, Duration) {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let continuing = previous.filter(|prev| {
            prev.content_hash == content_hash
                && now_ms.saturating_sub(prev.window_start_ms) < window_ms
        });
        let next = continuing.map_or(
            Self {
                content_hash,
                count: 1,
                window_start_ms: now_ms,
            },
            |prev| Self {
                count: prev.count.saturating_add(1),
                ..prev.clone()
            },
        );
        let elapsed = now_ms.saturating_sub(next.window_start_ms);
        let left_ms = u64::try_from(window_ms.saturating_sub(elapsed)).unwrap_or(0);
        let result = DuplicateResult {
            count: next.count,
            is_new: continuing.is_none(),
        };
        (next, result, Duration::from_millis(left_ms))
    }
}

/// Content fingerprint: the first eight bytes of the BLAKE3 digest, little
/// endian. Identical on every shard and toolchain, so trackers written by
/// one shard are read correctly by the others.
pub fn content_hash(content: &str) -> u64 {
    let digest = blake3::hash(content.as_bytes());
    digest
        .as_bytes()
        .first_chunk::<8>()
        .map_or(0, |head| u64::from_le_bytes(*head))
}

impl HybridCache {
    /// Count messages from `user_id` in `guild_id` within `window`.
    pub async fn track_spam_message(&self, guild_id: &str, user_id: &str, window: Duration) -> u64 {
        self.window_increment(&format!("spam:{guild_id}:{user_id}"), window)
            .await
            .count
    }

    /// Track consecutive identical messages from `user_id` in `guild_id`.
    ///
    /// Same content inside the window increments the count; different
    /// content or an elapsed window starts over at 1.
    pub async fn track_duplicate_message(
        &self,
        guild_id: &str,
        user_id: &str,
        content: &str,
        window: Duration,
    ) -> DuplicateResult {
        let key = format!("dup:{guild_id}:{user_id}");
        let hash = content_hash(content);

        if self.external().is_connected() {
            match self.external_duplicate(&key, hash, window).await {
                Ok(result) => return result,
                Err(e) => warn!(key, error = %e, "external duplicate tracking failed, using local fallback"),
            }
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut store = self.store();
        let raw = store.get(&key);
        let previous = raw
            .as_deref()
            .and_then(|r| serde_json::from_str::<DuplicateTracker>(r).ok());
        let (next, result, left) = DuplicateTracker::observe(previous.as_ref(), hash, now_ms, window);
        let encoded = serde_json::to_string(&next).unwrap_or_default();
        // The lock is held from read to write, so the swap cannot lose.
        store.compare_and_replace(&key, raw.as_deref(), encoded, left);
        result
    }

    /// Count a call against `limit` per `window` for `key`.
    pub async fn track_rate_limit(&self, key: &str, limit: u64, window: Duration) -> RateLimitDecision {
        let counted = self.window_increment(&format!("ratelimit:{key}"), window).await;
        RateLimitDecision {
            allowed: counted.count <= limit,
            remaining: limit.saturating_sub(counted.count),
            reset_in: counted.reset_in,
        }
    }

    async fn window_increment(&self, key: &str, window: Duration) -> WindowCount {
        if self.external().is_connected() {
            match self.external().incr_with_expiry(key, window).await {
                Ok(counted) => return counted,
                Err(e) => warn!(key, error = %e, "external counter failed, using local fallback"),
            }
        }
        self.store().incr_with_expiry(key, window)
    }

    async fn external_duplicate(
        &self,
        key: &str,
        hash: u64,
        window: Duration,
    ) -> Result<DuplicateResult, crate::error::CacheError> {
        let previous = self
            .external()
            .get(key)
            .await?
            .and_then(|raw| serde_json::from_str::<DuplicateTracker>(&raw).ok());
        let now_ms = Utc::now().timestamp_millis();
        let (next, result, left) = DuplicateTracker::observe(previous.as_ref(), hash, now_ms, window);
        let encoded = serde_json::to_string(&next)?;
        self.external().set_ex(key, &encoded, left).await?;
        Ok(result)
    }
}
