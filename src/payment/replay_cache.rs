//! LRU cache of consumed claim ids.
//!
//! Caches claim ids that have already been committed to escrow, so replayed
//! proofs are rejected quickly without a journal lookup. The cache is
//! bounded; the journal index remains the authoritative replay record
//! within its retention horizon.

use crate::claim::ClaimId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Default cache capacity (100,000 entries).
const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// LRU cache of consumed claim ids.
#[derive(Clone)]
pub struct ConsumedCache {
    inner: Arc<Mutex<LruCache<ClaimId, ()>>>,
    stats: Arc<Mutex<CacheStats>>,
}

/// Cache statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Number of cache hits (replays caught).
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries added.
    pub additions: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

impl ConsumedCache {
    /// Create a new cache with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create a new cache with the specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(cap))),
            stats: Arc::new(Mutex::new(CacheStats::default())),
        }
    }

    /// Check whether a claim id has been consumed.
    pub fn contains(&self, claim_id: &ClaimId) -> bool {
        let mut cache = self.inner.lock();
        let found = cache.get(claim_id).is_some();

        let mut stats = self.stats.lock();
        if found {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }

        found
    }

    /// Record a claim id as consumed.
    ///
    /// Called once the coordinator commits the claim to escrowing.
    pub fn insert(&self, claim_id: ClaimId) {
        let mut cache = self.inner.lock();
        cache.put(claim_id, ());

        let mut stats = self.stats.lock();
        stats.additions += 1;
    }

    /// Get current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for ConsumedCache {
    fn default() -> Self {
        Self::new()
    }
}
