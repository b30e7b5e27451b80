//! TTL cache with an entry budget and LRU eviction.
//!
//! Expiry depends only on `cached_at + ttl`; reads never extend it. Expired
//! entries stay resident until evicted or purged so degraded callers can still
//! read them explicitly through [`MemoryCache::get_stale`].

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub payload: V,
    pub cached_at: Instant,
    pub ttl: Duration,
    pub access_count: u64,
    last_used: u64,
}

impl<V> CacheEntry<V> {
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) >= self.ttl
    }
}

/// A value read from the cache along with its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<V> {
    pub payload: V,
    pub age: Duration,
    pub stale: bool,
    pub access_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_reads: u64,
    pub evictions: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    tick: u64,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn enforce_budget(&mut self, budget: usize, now: Instant) {
        while self.entries.len() > budget {
            let expired = self
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .min_by_key(|(_, e)| e.cached_at)
                .map(|(k, _)| k.clone());
            let victim = expired.or_else(|| {
                self.entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone())
            });
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
    }
}

pub struct MemoryCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    budget: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> MemoryCache<K, V> {
    /// Creates a cache holding at most `budget` entries (minimum 1).
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
                stats: CacheStats::default(),
            }),
            budget: budget.max(1),
        }
    }

    /// Returns the entry only while it is within its TTL.
    pub fn get(&self, key: &K) -> Option<CachedValue<V>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let value = match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_used = tick;
                Some(CachedValue {
                    payload: entry.payload.clone(),
                    age: now.saturating_duration_since(entry.cached_at),
                    stale: false,
                    access_count: entry.access_count,
                })
            }
            _ => None,
        };
        if value.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        value
    }

    /// Returns the entry whether or not it has expired.
    pub fn get_stale(&self, key: &K) -> Option<CachedValue<V>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let entry = inner.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_used = tick;
        let stale = entry.is_expired(now);
        let value = CachedValue {
            payload: entry.payload.clone(),
            age: now.saturating_duration_since(entry.cached_at),
            stale,
            access_count: entry.access_count,
        };
        if stale {
            inner.stats.stale_reads += 1;
        }
        Some(value)
    }

    /// Inserts or refreshes `key`, restarting its TTL.
    pub fn insert(&self, key: K, payload: V, ttl: Duration) {
        self.upsert_with(key, ttl, |_| payload);
    }

    /// Replaces the payload of `key` with `merge(previous)`, restarting its TTL.
    ///
    /// `previous` is the resident payload even if it has expired.
    pub fn upsert_with(&self, key: K, ttl: Duration, merge: impl FnOnce(Option<&V>) -> V) -> V {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let previous = inner.entries.get(&key);
        let payload = merge(previous.map(|e| &e.payload));
        let access_count = previous.map_or(0, |e| e.access_count);
        inner.entries.insert(
            key,
            CacheEntry {
                payload: payload.clone(),
                cached_at: now,
                ttl,
                access_count,
                last_used: tick,
            },
        );
        inner.enforce_budget(self.budget, now);
        payload
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().entries.remove(key).map(|e| e.payload)
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        before - inner.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }
}
