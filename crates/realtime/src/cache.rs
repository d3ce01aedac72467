//! In-memory response cache with TTL and a size cap
//!
//! Caches idempotent reads keyed by method, url and body. Eviction on write is
//! by insertion order (oldest inserted goes first), not by recency of reads.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Default cache TTL (5 minutes)
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default number of entries kept
pub const DEFAULT_CACHE_SIZE: usize = 100;

/// Cache entry with the time it was stored
#[derive(Clone)]
struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, max_age: Duration, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= max_age
    }
}

struct Store<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// Keys in insertion order
    order: VecDeque<String>,
}

impl<T> Store<T> {
    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }
}

/// Build the cache key for a request
pub fn cache_key(method: &str, url: &str, body: Option<&str>) -> String {
    format!(
        "{}:{}:{}",
        method.to_ascii_uppercase(),
        url,
        body.unwrap_or_default()
    )
}

/// Thread-safe response cache
pub struct ResponseCache<T> {
    store: Mutex<Store<T>>,
    max_age: Duration,
    max_size: usize,
}

impl<T: Clone> Default for ResponseCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_SIZE)
    }
}

impl<T: Clone> ResponseCache<T> {
    /// Create a new cache; `max_size` is clamped to at least one entry
    pub fn new(max_age: Duration, max_size: usize) -> Self {
        Self {
            store: Mutex::new(Store {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_age,
            max_size: max_size.max(1),
        }
    }

    fn with_store<R>(&self, f: impl FnOnce(&mut Store<T>) -> R) -> R {
        match self.store.lock() {
            Ok(mut store) => f(&mut store),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Get a cached value
    /// Returns None if not in cache or expired; expired entries are dropped
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        self.with_store(|store| {
            let expired = store.entries.get(key)?.is_expired(self.max_age, now);
            if expired {
                store.remove(key);
                None
            } else {
                store.entries.get(key).map(|entry| entry.value.clone())
            }
        })
    }

    /// Cache a value, evicting the oldest inserted entry when full
    pub fn set(&self, key: &str, value: T) {
        let stored_at = Instant::now();
        self.with_store(|store| {
            if let Some(entry) = store.entries.get_mut(key) {
                *entry = CacheEntry { value, stored_at };
                return;
            }

            if store.entries.len() >= self.max_size {
                if let Some(oldest) = store.order.pop_front() {
                    store.entries.remove(&oldest);
                    tracing::trace!(key = %oldest, "Evicted oldest cache entry");
                }
            }

            store.order.push_back(key.to_string());
            store
                .entries
                .insert(key.to_string(), CacheEntry { value, stored_at });
        });
    }

    /// True if a fresh entry exists for the key
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Invalidate a specific key
    pub fn delete(&self, key: &str) -> bool {
        self.with_store(|store| store.remove(key))
    }

    /// Invalidate every entry whose key starts with `prefix`
    pub fn delete_prefix(&self, prefix: &str) {
        self.with_store(|store| {
            store.entries.retain(|k, _| !k.starts_with(prefix));
            store.order.retain(|k| !k.starts_with(prefix));
        });
    }

    pub fn clear(&self) {
        self.with_store(|store| {
            store.entries.clear();
            store.order.clear();
        });
    }

    pub fn len(&self) -> usize {
        self.with_store(|store| store.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear expired entries (call periodically for memory management)
    pub fn cleanup(&self) {
        let now = Instant::now();
        let max_age = self.max_age;
        self.with_store(|store| {
            let before = store.entries.len();
            store
                .entries
                .retain(|_, entry| !entry.is_expired(max_age, now));
            let entries = &store.entries;
            store.order.retain(|k| entries.contains_key(k));

            let removed = before - store.entries.len();
            if removed > 0 {
                tracing::debug!(removed, remaining = store.entries.len(), "Swept expired cache entries");
            }
        });
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        self.with_store(|store| {
            let total = store.entries.len();
            let expired = store
                .entries
                .values()
                .filter(|e| e.is_expired(self.max_age, now))
                .count();
            CacheStats {
                total_entries: total,
                expired_entries: expired,
                active_entries: total - expired,
            }
        })
    }
}

/// Cache statistics
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cache_get_set() {
        let cache = ResponseCache::new(Duration::from_secs(60), 10);

        // Initially empty
        assert!(cache.get("GET:/tickets:").is_none());

        cache.set("GET:/tickets:", 42);
        assert_eq!(cache.get("GET:/tickets:"), Some(42));
        assert!(cache.has("GET:/tickets:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiration() {
        let cache = ResponseCache::new(Duration::from_millis(50), 10);

        cache.set("k", "v".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(cache.get("k").is_none());
        assert!(!cache.has("k"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_drops_first_inserted_key() {
        let cache = ResponseCache::new(Duration::from_secs(60), 3);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);

        // Reading "a" does not protect it; eviction is by insertion order
        assert_eq!(cache.get("a"), Some(1));
        cache.set("d", 4);

        assert_eq!(cache.len(), 3);
        assert!(!cache.has("a"));
        assert!(cache.has("b"));
        assert!(cache.has("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_does_not_evict() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_and_stats() {
        let cache = ResponseCache::new(Duration::from_millis(100), 10);
        cache.set("old", 1);
        tokio::time::advance(Duration::from_millis(80)).await;
        cache.set("new", 2);
        tokio::time::advance(Duration::from_millis(30)).await;

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.active_entries, 1);

        cache.cleanup();
        assert_eq!(cache.len(), 1);
        assert!(cache.has("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_clear() {
        let cache = ResponseCache::new(Duration::from_secs(60), 10);
        cache.set("GET:/chat/u1?before=1:", 1);
        cache.set("GET:/chat/u1?before=2:", 2);
        cache.set("GET:/tickets:", 3);

        assert!(cache.delete("GET:/tickets:"));
        assert!(!cache.delete("GET:/tickets:"));

        cache.delete_prefix("GET:/chat/u1");
        assert!(cache.is_empty());

        cache.set("x", 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_caches() {
        let api = ResponseCache::new(Duration::from_secs(60), 10);
        let images = ResponseCache::new(Duration::from_secs(600), 1);
        api.set("k", 1);
        images.set("other", 2);

        assert!(api.has("k"));
        assert!(!images.has("k"));
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(
            cache_key("get", "/chat/u1", None),
            "GET:/chat/u1:"
        );
        assert_ne!(
            cache_key("POST", "/ai/ask", Some("{\"a\":1}")),
            cache_key("POST", "/ai/ask", Some("{\"a\":2}"))
        );
    }
}
