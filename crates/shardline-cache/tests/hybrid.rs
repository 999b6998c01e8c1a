//! Hybrid cache behaviour against a controllable in-memory external cache.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::indexing_slicing
)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use shardline_cache::{
    CacheError, DuplicateResult, ExternalCache, HybridCache, WindowCount, glob_match,
};

// =============================================================================
// Fake external cache
// =============================================================================

#[derive(Default)]
struct FakeExternal {
    connected: AtomicBool,
    failing: AtomicBool,
    values: Mutex<HashMap<String, String>>,
    incr_calls: Mutex<Vec<String>>,
}

impl FakeExternal {
    fn connected() -> Arc<Self> {
        let fake = Self::default();
        fake.connected.store(true, Ordering::SeqCst);
        Arc::new(fake)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Backend("READONLY replica".to_owned()))
        } else {
            Ok(())
        }
    }

    fn raw(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ExternalCache for FakeExternal {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self.raw(key))
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.values
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        Ok(self.values.lock().unwrap().remove(key).is_some())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        self.check()?;
        let mut values = self.values.lock().unwrap();
        let before = values.len();
        values.retain(|k, _| !glob_match(pattern, k));
        Ok(u64::try_from(before.saturating_sub(values.len())).unwrap())
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, CacheError> {
        self.check()?;
        self.incr_calls.lock().unwrap().push(key.to_owned());
        let mut values = self.values.lock().unwrap();
        let count = values
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            .saturating_add(1);
        values.insert(key.to_owned(), count.to_string());
        Ok(WindowCount {
            count,
            reset_in: window,
        })
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }
}

fn cache_over(fake: &Arc<FakeExternal>, max: usize) -> HybridCache {
    HybridCache::new(Arc::clone(fake) as Arc<dyn ExternalCache>, max)
}

// =============================================================================
// Read/write paths
// =============================================================================

#[tokio::test]
async fn writes_go_to_both_stores() {
    let fake = FakeExternal::connected();
    let cache = cache_over(&fake, 100);
    cache.set("guild:1", "settings", None).await;

    assert_eq!(fake.raw("guild:1").as_deref(), Some("settings"));
    assert_eq!(cache.stats().fallback_entries, 1);
}

#[tokio::test]
async fn disconnect_serves_local_copy() {
    let fake = FakeExternal::connected();
    let cache = cache_over(&fake, 100);
    cache.set("guild:1", "settings", None).await;

    fake.connected.store(false, Ordering::SeqCst);
    assert_eq!(cache.get("guild:1").await.as_deref(), Some("settings"));
    assert!(!cache.stats().external_connected);
}

#[tokio::test]
async fn failing_external_read_serves_local_copy() {
    let fake = FakeExternal::connected();
    let cache = cache_over(&fake, 100);
    cache.set("guild:1", "settings", None).await;

    fake.failing.store(true, Ordering::SeqCst);
    assert_eq!(cache.get("guild:1").await.as_deref(), Some("settings"));
}

#[tokio::test]
async fn failing_external_write_keeps_local_copy() {
    let fake = FakeExternal::connected();
    fake.failing.store(true, Ordering::SeqCst);
    let cache = cache_over(&fake, 100);
    cache.set("k", "v", None).await;
    assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    assert_eq!(fake.raw("k"), None);
}

#[tokio::test]
async fn external_miss_is_a_miss() {
    let fake = FakeExternal::connected();
    let cache = cache_over(&fake, 100);
    cache.set("k", "v", None).await;
    // Another shard deleted the key externally.
    fake.values.lock().unwrap().clear();
    assert_eq!(cache.get("k").await, None);
}

#[tokio::test]
async fn delete_pattern_clears_both_stores() {
    let fake = FakeExternal::connected();
    let cache = cache_over(&fake, 100);
    for key in ["guild:1:settings", "guild:2:settings", "user:1"] {
        cache.set(key, "x", None).await;
    }
    assert_eq!(cache.delete_pattern("guild:*").await, 2);
    assert_eq!(cache.stats().fallback_entries, 1);
    assert_eq!(fake.values.lock().unwrap().len(), 1);
}

// =============================================================================
// Expiry and bounds
// =============================================================================

#[tokio::test(start_paused = true)]
async fn one_second_ttl_expires() {
    let cache = HybridCache::local_only(100);
    cache.set("k", "v", Some(Duration::from_secs(1))).await;
    assert_eq!(cache.get("k").await.as_deref(), Some("v"));

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(cache.sweep(), 1);
    assert_eq!(cache.get("k").await, None);
}

#[tokio::test(start_paused = true)]
async fn zero_sweep_interval_still_sweeps() {
    let cache = Arc::new(HybridCache::local_only(100));
    cache.set("k", "v", Some(Duration::from_secs(1))).await;

    let sweeper = cache.spawn_sweeper(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert!(!sweeper.is_finished());
    assert_eq!(cache.stats().fallback_entries, 0);
    sweeper.abort();
}

#[tokio::test]
async fn ten_thousand_unique_sets_stay_bounded() {
    let cache = HybridCache::local_only(1_000);
    for i in 0..10_000 {
        cache.set(&format!("key:{i}"), "v", None).await;
        assert!(cache.stats().fallback_entries <= 1_000);
    }
    assert_eq!(cache.stats().fallback_entries, 1_000);
}

proptest! {
    /// Property: any interleaving of sets and deletes stays within capacity.
    #[test]
    fn fallback_never_exceeds_capacity(
        max in 1_usize..50,
        ops in proptest::collection::vec((0_u8..2, 0_u16..200), 1..400),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let cache = HybridCache::local_only(max);
            for (op, key) in ops {
                let key = format!("k{key}");
                if op == 0 {
                    cache.set(&key, "v", None).await;
                } else {
                    cache.delete(&key).await;
                }
                prop_assert!(cache.stats().fallback_entries <= max);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// =============================================================================
// Trackers
// =============================================================================

#[tokio::test]
async fn duplicate_tracking_through_external_cache() {
    let fake = FakeExternal::connected();
    let cache = cache_over(&fake, 100);
    let window = Duration::from_secs(30);

    let first = cache.track_duplicate_message("g", "u", "hello", window).await;
    let second = cache.track_duplicate_message("g", "u", "hello", window).await;
    let changed = cache.track_duplicate_message("g", "u", "bye", window).await;

    assert_eq!(first, DuplicateResult { count: 1, is_new: true });
    assert_eq!(second, DuplicateResult { count: 2, is_new: false });
    assert_eq!(changed, DuplicateResult { count: 1, is_new: true });
    assert!(fake.raw("dup:g:u").is_some());
}

#[tokio::test]
async fn counters_use_external_increment_when_connected() {
    let fake = FakeExternal::connected();
    let cache = cache_over(&fake, 100);
    let window = Duration::from_secs(10);

    assert_eq!(cache.track_spam_message("g", "u", window).await, 1);
    assert_eq!(cache.track_spam_message("g", "u", window).await, 2);
    let decision = cache.track_rate_limit("cmd:u", 5, window).await;
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 4);

    let calls = fake.incr_calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["spam:g:u", "spam:g:u", "ratelimit:cmd:u"]);
}

#[tokio::test]
async fn counters_fall_back_when_external_fails() {
    let fake = FakeExternal::connected();
    fake.failing.store(true, Ordering::SeqCst);
    let cache = cache_over(&fake, 100);
    let window = Duration::from_secs(10);

    assert_eq!(cache.track_spam_message("g", "u", window).await, 1);
    assert_eq!(cache.track_spam_message("g", "u", window).await, 2);
    assert_eq!(cache.stats().fallback_entries, 1);
}
