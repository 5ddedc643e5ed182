//! Validation cache shared by every loader launched from one host context.
//!
//! Loaders HMAC their code with the [session key](ValidationCache::session_key)
//! and ask the host whether the resulting signature already passed
//! validation. A miss only costs a re-validation; a hit must never be
//! produced for code that was not recorded, which is why the key is fresh
//! for every cache and never written anywhere.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use rand::RngCore;
use rand::rngs::OsRng;

/// Default number of signatures remembered.
pub const DEFAULT_CAPACITY: usize = 200;

/// Session key length: the SHA-256 block size, not its digest size.
pub const SESSION_KEY_LEN: usize = 64;

/// Counters describing cache traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CacheStats {
    /// Number of [`ValidationCache::query`] calls.
    pub queries: u64,
    /// Queries answered `true`.
    pub hits: u64,
    /// Number of [`ValidationCache::record`] calls.
    pub sets: u64,
}

/// LRU state guarded by the cache mutex.
#[derive(Debug)]
struct Inner {
    /// Signature → known-to-validate.
    entries: LruCache<Vec<u8>, bool>,
    /// Traffic counters.
    stats: CacheStats,
}

/// Bounded signature → "known to validate" cache with a per-session key.
#[derive(Debug)]
pub struct ValidationCache {
    /// Entries and counters.
    inner: Mutex<Inner>,
    /// Random HMAC key, generated once per cache.
    session_key: [u8; SESSION_KEY_LEN],
}

impl ValidationCache {
    /// Creates an empty cache holding at most `capacity` signatures.
    pub fn new(capacity: NonZeroUsize) -> Self {
        let mut session_key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut session_key);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            session_key,
        }
    }

    /// Returns `true` iff `signature` was previously [recorded](Self::record).
    ///
    /// A hit marks the entry as most recently used.
    pub fn query(&self, signature: &[u8]) -> bool {
        let mut inner = self.lock();
        let known = inner.entries.get(signature).copied().unwrap_or(false);
        inner.stats.queries += 1;
        if known {
            inner.stats.hits += 1;
        }
        tracing::debug!(known, "validation cache query");
        known
    }

    /// Records `signature` as known to validate, evicting the least
    /// recently used entry when full.
    pub fn record(&self, signature: &[u8]) {
        let mut inner = self.lock();
        inner.entries.put(signature.to_vec(), true);
        inner.stats.sets += 1;
        tracing::debug!(entries = inner.entries.len(), "validation cache set");
    }

    /// Key loaders use to HMAC signatures before querying.
    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Number of signatures currently cached.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if nothing has been recorded (or everything evicted).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of signatures kept.
    pub fn capacity(&self) -> usize {
        self.lock().entries.cap().get()
    }

    /// Locks the inner state. A poisoned lock still holds a consistent LRU.
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ValidationCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}
