//! C2 — bounded, thread-safe TTL cache used by every source client and by
//! the pipeline's result cache. Eviction is lazy on access plus a periodic
//! sweep; on overflow the earliest-expiring entry is evicted first, ties
//! broken by oldest insertion.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// A bounded key→value store with per-entry TTLs, safe for concurrent
/// readers and writers via a single `parking_lot::Mutex`.
pub struct TtlCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        })
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let live = inner
            .entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone());

        if live.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
            // Lazily drop an expired-but-not-yet-swept entry.
            inner.entries.remove(key);
        }
        live
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                inserted_at: now,
            },
        );

        while inner.entries.len() > self.capacity {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.expires_at, e.inserted_at))
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                inner.entries.remove(&victim);
                inner.evictions += 1;
            } else {
                break;
            }
        }
    }

    pub fn delete(&self, key: &K) {
        self.inner.lock().entries.remove(key);
    }

    /// Drops every entry whose TTL has elapsed. Intended to run on a
    /// periodic background tick; `get`/`set` remain correct without it.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        inner.evictions += (before - inner.entries.len()) as u64;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            len: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_absent_even_before_sweep() {
        let cache: Arc<TtlCache<String, u32>> = TtlCache::new(10);
        cache.set("a".into(), 1, Duration::from_millis(10));
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn overflow_evicts_earliest_expiring_first() {
        let cache: Arc<TtlCache<&'static str, u32>> = TtlCache::new(2);
        cache.set("short", 1, Duration::from_millis(10));
        cache.set("long", 2, Duration::from_secs(10));
        cache.set("newest", 3, Duration::from_secs(10));

        let stats = cache.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(cache.get(&"short"), None);
        assert_eq!(cache.get(&"long"), Some(2));
        assert_eq!(cache.get(&"newest"), Some(3));
    }

    #[test]
    fn sweep_drops_expired_and_counts_eviction() {
        let cache: Arc<TtlCache<&'static str, u32>> = TtlCache::new(10);
        cache.set("a", 1, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert_eq!(cache.stats().len, 0);
        assert_eq!(cache.stats().evictions, 1);
    }
}
