//! Bounded in-memory fallback store.
//!
//! Entries carry an absolute expiry instant instead of a timer. Expired
//! entries are dropped lazily on read and in bulk by [`FallbackStore::sweep`].
//! When the store is full, the oldest-inserted entry is evicted (FIFO).
//!
//! Time comes from [`tokio::time::Instant`], so tests can drive expiry with
//! a paused clock.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::external::WindowCount;

/// Longest lifetime an entry can be given.
const MAX_TTL: Duration = Duration::from_secs(31_536_000);

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
    seq: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// FIFO-bounded map of string values with per-entry expiry.
#[derive(Debug)]
pub struct FallbackStore {
    entries: HashMap<String, Entry>,
    /// Insertion sequence number to key, oldest first.
    order: BTreeMap<u64, String>,
    next_seq: u64,
    max_entries: usize,
}

impl FallbackStore {
    /// Create a store holding at most `max_entries` (at least 1).
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            max_entries: max_entries.max(1),
        }
    }

    /// Number of entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    pub const fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Live value for `key`. An expired entry is removed and reads as absent.
    pub fn get(&mut self, key: &str) -> Option<String> {
        self.get_live(key).map(|entry| entry.value.clone())
    }

    /// Live value and remaining lifetime for `key`.
    pub fn get_with_ttl(&mut self, key: &str) -> Option<(String, Duration)> {
        let now = Instant::now();
        self.get_live(key)
            .map(|entry| (entry.value.clone(), entry.expires_at.saturating_duration_since(now)))
    }

    /// Store `value` under `key` for `ttl`.
    ///
    /// Re-setting a key moves it to the back of the eviction order.
    pub fn insert(&mut self, key: &str, value: String, ttl: Duration) {
        let expires_at = deadline(Instant::now(), ttl);
        self.insert_until(key, value, expires_at);
    }

    /// Remove `key`. Returns whether a live entry was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let now = Instant::now();
        self.remove_entry(key).is_some_and(|entry| entry.is_live(now))
    }

    /// Remove every key matching a glob pattern (`*`, `?`). Returns the
    /// number of entries removed.
    pub fn remove_matching(&mut self, pattern: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        for key in &keys {
            self.remove_entry(key);
        }
        keys.len()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove_entry(key);
        }
        expired.len()
    }

    /// Increment the counter at `key` inside its current window, or start a
    /// new `window`-long window at 1 if there is no live counter.
    ///
    /// The window end is fixed when the counter is created; increments do
    /// not extend it.
    pub fn incr_with_expiry(&mut self, key: &str, window: Duration) -> WindowCount {
        let now = Instant::now();
        let current = self
            .get_live(key)
            .map(|entry| (entry.value.parse::<u64>().unwrap_or(0), entry.expires_at));

        let (count, expires_at) = match current {
            Some((count, expires_at)) => (count.saturating_add(1), expires_at),
            None => (1, deadline(now, window)),
        };
        self.insert_until(key, count.to_string(), expires_at);
        WindowCount {
            count,
            reset_in: expires_at.saturating_duration_since(now),
        }
    }

    /// Replace the value at `key` only if its current live value equals
    /// `expected` (`None` = absent). Returns whether the swap happened.
    pub fn compare_and_replace(
        &mut self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> bool {
        let current = self.get_live(key).map(|entry| entry.value.as_str());
        if current != expected {
            return false;
        }
        self.insert(key, value, ttl);
        true
    }

    fn get_live(&mut self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        let expired = self.entries.get(key).is_some_and(|e| !e.is_live(now));
        if expired {
            self.remove_entry(key);
            return None;
        }
        self.entries.get(key)
    }

    fn insert_until(&mut self, key: &str, value: String, expires_at: Instant) {
        self.remove_entry(key);
        while self.entries.len() >= self.max_entries {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.order.insert(seq, key.to_owned());
        self.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
    }

    fn remove_entry(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }
}

/// Glob match supporting `*` (any run) and `?` (any one character).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0_usize, 0_usize);
    // Position of the last `*` and the text index it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p = p.saturating_add(1);
            }
            Some(&c) if c == '?' || text.get(t) == Some(&c) => {
                p = p.saturating_add(1);
                t = t.saturating_add(1);
            }
            _ => match backtrack {
                Some((star, absorbed)) => {
                    let absorbed = absorbed.saturating_add(1);
                    backtrack = Some((star, absorbed));
                    p = star.saturating_add(1);
                    t = absorbed;
                }
                None => return false,
            },
        }
    }
    pattern.iter().skip(p).all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_lazily() {
        let mut store = FallbackStore::new(10);
        store.insert("k", "v".to_owned(), Duration::from_secs(1));
        assert_eq!(store.get("k"), Some("v".to_owned()));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let mut store = FallbackStore::new(10);
        store.insert("short", "a".to_owned(), Duration::from_secs(1));
        store.insert("long", "b".to_owned(), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long"), Some("b".to_owned()));
    }

    #[tokio::test]
    async fn full_store_evicts_oldest_inserted() {
        let mut store = FallbackStore::new(3);
        for key in ["a", "b", "c"] {
            store.insert(key, key.to_owned(), Duration::from_secs(60));
        }
        // Re-setting "a" makes it the newest.
        store.insert("a", "a2".to_owned(), Duration::from_secs(60));
        store.insert("d", "d".to_owned(), Duration::from_secs(60));

        assert_eq!(store.len(), 3);
        assert_eq!(store.get("b"), None);
        assert_eq!(store.get("a"), Some("a2".to_owned()));
        assert_eq!(store.get("c"), Some("c".to_owned()));
        assert_eq!(store.get("d"), Some("d".to_owned()));
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let mut store = FallbackStore::new(100);
        for i in 0..10_000 {
            store.insert(&format!("key:{i}"), i.to_string(), Duration::from_secs(300));
            assert!(store.len() <= 100);
        }
        assert_eq!(store.get("key:9999"), Some("9999".to_owned()));
        assert_eq!(store.get("key:0"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_window_is_fixed_at_creation() {
        let mut store = FallbackStore::new(10);
        let first = store.incr_with_expiry("spam:1:2", Duration::from_secs(10));
        assert_eq!(first.count, 1);
        assert_eq!(first.reset_in, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = store.incr_with_expiry("spam:1:2", Duration::from_secs(10));
        assert_eq!(second.count, 2);
        assert_eq!(second.reset_in, Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(7)).await;
        let third = store.incr_with_expiry("spam:1:2", Duration::from_secs(10));
        assert_eq!(third.count, 1);
    }

    #[tokio::test]
    async fn compare_and_replace_checks_current_value() {
        let mut store = FallbackStore::new(10);
        let ttl = Duration::from_secs(5);
        assert!(store.compare_and_replace("k", None, "1".to_owned(), ttl));
        assert!(!store.compare_and_replace("k", None, "2".to_owned(), ttl));
        assert!(store.compare_and_replace("k", Some("1"), "2".to_owned(), ttl));
        assert_eq!(store.get("k"), Some("2".to_owned()));
    }

    #[tokio::test]
    async fn remove_matching_uses_glob() {
        let mut store = FallbackStore::new(10);
        for key in ["guild:1:settings", "guild:2:settings", "user:1"] {
            store.insert(key, String::new(), Duration::from_secs(60));
        }
        assert_eq!(store.remove_matching("guild:*"), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn glob_semantics() {
        assert!(glob_match("*", ""));
        assert!(glob_match("guild:*", "guild:1:settings"));
        assert!(glob_match("guild:?:settings", "guild:1:settings"));
        assert!(!glob_match("guild:?:settings", "guild:12:settings"));
        assert!(glob_match("*:settings", "guild:12:settings"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
        assert!(!glob_match("user:*", "guild:1"));
        assert!(glob_match("exact", "exact"));
    }
}
