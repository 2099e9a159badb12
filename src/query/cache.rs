//! TTL page cache
//!
//! Caches whole pages keyed by endpoint, filter fingerprint, cursor and page
//! size. Expired entries are dropped on access; when full the least recently
//! used entry is evicted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Identity of a cached page
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub endpoint: String,
    pub fingerprint: String,
    pub cursor: Option<String>,
    pub page_size: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_accessed: now,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub ttl_evictions: u64,
    pub size_evictions: u64,
    pub entry_count: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    stats: CacheStats,
}

/// TTL cache with LRU eviction
pub struct PageCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    inner: RwLock<Inner<K, V>>,
    ttl: Duration,
    max_entries: usize,
}

impl<K, V> PageCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.write().await;
        let Inner { entries, stats } = &mut *inner;

        match entries.get(key).map(|entry| entry.is_expired(self.ttl)) {
            Some(true) => {
                entries.remove(key);
                stats.ttl_evictions += 1;
                stats.misses += 1;
                stats.entry_count = entries.len();
                debug!("Cache entry expired and removed");
                None
            }
            Some(false) => {
                stats.hits += 1;
                entries.get_mut(key).map(|entry| {
                    entry.last_accessed = Instant::now();
                    entry.value.clone()
                })
            }
            None => {
                stats.misses += 1;
                trace!("Cache miss");
                None
            }
        }
    }

    pub async fn put(&self, key: K, value: V) {
        let mut inner = self.inner.write().await;
        let Inner { entries, stats } = &mut *inner;

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let lru = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone());
            if let Some(lru) = lru {
                entries.remove(&lru);
                stats.size_evictions += 1;
            }
        }

        entries.insert(key, CacheEntry::new(value));
        stats.entry_count = entries.len();
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.stats.entry_count = 0;
        debug!("Page cache cleared");
    }

    pub async fn stats(&self) -> CacheStats {
        self.inner.read().await.stats.clone()
    }
}
