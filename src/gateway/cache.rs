//! Response Cache
//!
//! Content-addressed store of previous generations. A bounded in-memory LRU
//! sits in front of an optional [`DurableCache`] so hits survive a restart.
//! Expired entries count as misses and are purged when touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::durable::DurableCache;
use super::fingerprint::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub text: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub response: CachedResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, response: CachedResponse, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            fingerprint,
            response,
            created_at,
            expires_at: created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub writes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

struct Slot {
    entry: CacheEntry,
    last_used: u64,
}

/// Recency is a monotonically increasing tick; the smallest tick is the
/// least recently used entry.
struct MemoryTier {
    capacity: usize,
    tick: u64,
    slots: HashMap<Fingerprint, Slot>,
    recency: BTreeMap<u64, Fingerprint>,
}

impl MemoryTier {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            slots: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, fp: &Fingerprint) -> Option<CacheEntry> {
        let tick = self.next_tick();
        let slot = self.slots.get_mut(fp)?;
        self.recency.remove(&slot.last_used);
        slot.last_used = tick;
        self.recency.insert(tick, *fp);
        Some(slot.entry.clone())
    }

    fn remove(&mut self, fp: &Fingerprint) {
        if let Some(slot) = self.slots.remove(fp) {
            self.recency.remove(&slot.last_used);
        }
    }

    /// Inserts unless an unexpired entry exists. Returns the number of
    /// entries evicted to stay within capacity.
    fn insert(&mut self, entry: CacheEntry, now: DateTime<Utc>) -> u64 {
        if self.capacity == 0 {
            return 0;
        }
        if let Some(existing) = self.slots.get(&entry.fingerprint) {
            if !existing.entry.is_expired_at(now) {
                return 0;
            }
        }
        self.remove(&entry.fingerprint);

        let tick = self.next_tick();
        self.recency.insert(tick, entry.fingerprint);
        self.slots.insert(entry.fingerprint, Slot { entry, last_used: tick });

        let mut evicted = 0;
        while self.slots.len() > self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else { break };
            self.slots.remove(&oldest);
            evicted += 1;
        }
        evicted
    }
}

pub struct ResponseCache {
    memory: Mutex<MemoryTier>,
    durable: Option<Arc<dyn DurableCache>>,
    default_ttl: Duration,
    counters: Counters,
}

impl ResponseCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::new(capacity)),
            durable: None,
            default_ttl,
            counters: Counters::default(),
        }
    }

    pub fn with_durable(mut self, store: Arc<dyn DurableCache>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.memory().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let now = Utc::now();

        let in_memory = self.memory().touch(fingerprint);
        if let Some(entry) = in_memory {
            if !entry.is_expired_at(now) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry);
            }
            self.expire(fingerprint).await;
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(durable) = &self.durable {
            match durable.get(fingerprint).await {
                Ok(Some(entry)) if !entry.is_expired_at(now) => {
                    debug!(fingerprint = %fingerprint, "Durable cache hit; promoting");
                    let evicted = self.memory().insert(entry.clone(), now);
                    self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry);
                }
                Ok(Some(_)) => self.expire(fingerprint).await,
                Ok(None) => {}
                Err(e) => warn!(fingerprint = %fingerprint, "Durable cache read failed: {}", e),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores `response` for `ttl` (the cache default when `None`). An
    /// unexpired entry under the same fingerprint is kept as is.
    pub async fn put(&self, fingerprint: Fingerprint, response: CachedResponse, ttl: Option<Duration>) {
        let entry = CacheEntry::new(fingerprint, response, ttl.unwrap_or(self.default_ttl));
        let evicted = self.memory().insert(entry.clone(), entry.created_at);
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.put(&entry).await {
                warn!(fingerprint = %fingerprint, "Durable cache write failed: {}", e);
            }
        }
    }

    async fn expire(&self, fingerprint: &Fingerprint) {
        self.memory().remove(fingerprint);
        self.counters.expired.fetch_add(1, Ordering::Relaxed);
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove(fingerprint).await {
                warn!(fingerprint = %fingerprint, "Durable cache purge failed: {}", e);
            }
        }
    }

    /// Drops every expired entry from both tiers.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = {
            let mut memory = self.memory();
            let stale: Vec<Fingerprint> = memory
                .slots
                .values()
                .filter(|s| s.entry.is_expired_at(now))
                .map(|s| s.entry.fingerprint)
                .collect();
            for fp in &stale {
                memory.remove(fp);
            }
            stale.len()
        };
        if let Some(durable) = &self.durable {
            match durable.purge_expired().await {
                Ok(n) => removed += n,
                Err(e) => warn!("Durable cache purge failed: {}", e),
            }
        }
        removed
    }

    /// Empties the memory tier only.
    pub fn clear_memory(&self) {
        let mut memory = self.memory();
        memory.slots.clear();
        memory.recency.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            durable_hits: c.durable_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
        }
    }
}
