//! Sharded LRU artifact store with per-entry TTL.

use super::key::CacheKey;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_SHARDS: usize = 16;

/// One stored artifact.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Synthesized (and, where required, watermarked) audio
    pub artifact: Bytes,
    /// When the entry was written
    pub created_at: Instant,
    /// Lifetime from `created_at`
    pub ttl: Duration,
    /// Number of reads served from this entry
    pub hit_count: u64,
}

impl CacheEntry {
    /// Returns `true` once the entry has outlived its TTL.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads answered from the cache
    pub hits: u64,
    /// Reads that found nothing (or an expired entry)
    pub misses: u64,
    /// Successful writes
    pub inserts: u64,
    /// Entries pushed out by capacity pressure
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Live entries (expired-but-unswept included)
    pub entries: usize,
}

impl CacheStats {
    /// `hits / (hits + misses)`, or 0 before any read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Key to artifact mapping shared by both lanes.
///
/// Lanes are partitioned logically through the lane tag inside
/// [`CacheKey`]. Each shard has its own lock and its own LRU order; a write
/// is fully built before it is inserted, so readers only ever see complete
/// entries.
pub struct CacheStore {
    shards: Vec<Mutex<LruCache<CacheKey, CacheEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStore {
    /// Create a store holding at most roughly `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let shard_count = DEFAULT_SHARDS.min(capacity.max(1));
        let per_shard = capacity.max(1).div_ceil(shard_count);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);

        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<LruCache<CacheKey, CacheEntry>> {
        let index = (key.shard_hint() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Look up a live artifact. Expired entries are removed on sight.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();

        let expired = match shard.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                let artifact = entry.artifact.clone();
                drop(shard);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(artifact);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            shard.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        drop(shard);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `artifact` under `key` for `ttl`.
    ///
    /// Idempotent for identical content; concurrent writers to one key
    /// resolve last-writer-wins.
    pub fn put(&self, key: CacheKey, artifact: Bytes, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry {
            artifact,
            created_at: Instant::now(),
            ttl,
            hit_count: 0,
        };

        let displaced = self.shard(&key).lock().push(key.clone(), entry);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        if let Some((old_key, _)) = displaced {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Entry metadata without touching LRU order or counters.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.shard(key).lock().peek(key).cloned()
    }

    /// Remove one key. Returns `true` if it was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.shard(key).lock().pop(key).is_some()
    }

    /// Drop every entry.
    pub fn flush(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
        tracing::info!("Artifact cache flushed");
    }

    /// Actively remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for shard in &self.shards {
            let mut shard = shard.lock();
            let expired: Vec<CacheKey> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                shard.pop(key);
            }
            removed += expired.len();
        }

        self.expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
