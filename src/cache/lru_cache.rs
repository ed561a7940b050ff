use dashmap::DashMap;
use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::debug;

/// Cache entry with TTL and an access stamp for LRU eviction
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Option<Duration>,
    last_access: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.created_at) > ttl,
            None => false,
        }
    }
}

/// Bounded cache with per-entry TTL; the least recently used entry is
/// evicted when the capacity is exceeded.
#[derive(Debug)]
pub struct LRUCache<K: Clone + Eq + Hash, V> {
    data: Arc<DashMap<K, CacheEntry<V>>>,
    capacity: usize,
    default_ttl: Option<Duration>,
    clock: Arc<AtomicU64>,
}

impl<K, V> LRUCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            default_ttl,
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.insert_with_ttl(key, value, self.default_ttl)
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) -> Option<V> {
        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl,
            last_access: self.tick(),
        };
        let previous = self.data.insert(key, entry).map(|old| old.value);

        while self.data.len() > self.capacity {
            if !self.evict_least_recent() {
                break;
            }
        }

        previous
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let stamp = self.tick();
        let mut entry = self.data.get_mut(key)?;
        if entry.is_expired(Instant::now()) {
            drop(entry);
            self.data.remove(key);
            return None;
        }
        entry.last_access = stamp;
        Some(entry.value.clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Removes expired entries and returns how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.data.len());

        if removed > 0 {
            debug!("Removed {} expired cache entries", removed);
        }

        removed
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_least_recent(&self) -> bool {
        let oldest = self
            .data
            .iter()
            .min_by_key(|entry| entry.value().last_access)
            .map(|entry| entry.key().clone());

        match oldest {
            Some(key) => self.data.remove(&key).is_some(),
            None => false,
        }
    }
}

impl<K, V> Clone for LRUCache<K, V>
where
    K: Clone + Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            capacity: self.capacity,
            default_ttl: self.default_ttl,
            clock: self.clock.clone(),
        }
    }
}
