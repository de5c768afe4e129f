//! Bounded cache of compiled step logic.
//!
//! Step types that compile user-supplied source (expressions, scripts)
//! share compiled artifacts through a [`LogicCache`] keyed by the SHA-256 of
//! the source text. The cache is owned by a pipeline builder or injected into
//! it, so separate pipelines can share one or keep their own.

use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Default number of compiled artifacts kept.
pub const DEFAULT_LOGIC_CACHE_SIZE: usize = 100;

type Compiled = Arc<dyn Any + Send + Sync>;

/// LRU cache of compiled artifacts keyed by source checksum.
pub struct LogicCache {
    entries: Mutex<LruCache<String, Compiled>>,
    capacity: NonZeroUsize,
}

impl std::fmt::Debug for LogicCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for LogicCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOGIC_CACHE_SIZE)
    }
}

impl LogicCache {
    /// Create a cache holding at most `capacity` entries (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            capacity,
        }
    }

    /// Hex SHA-256 of `source`, the cache key.
    #[must_use]
    pub fn checksum(source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Return the artifact compiled from `source`, compiling it with
    /// `compile` on a miss. Compilation runs under the cache lock, so
    /// concurrent callers with the same source compile once.
    ///
    /// An entry stored under the same checksum with a different type is
    /// replaced.
    pub fn get_or_try_insert_with<T, E, F>(&self, source: &str, compile: F) -> Result<Arc<T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce(&str) -> Result<T, E>,
    {
        let key = Self::checksum(source);
        let mut entries = self.entries.lock();
        if let Some(hit) = entries.get(&key) {
            if let Ok(typed) = Arc::clone(hit).downcast::<T>() {
                tracing::trace!(checksum = %key, "Logic cache hit");
                return Ok(typed);
            }
        }
        let compiled = Arc::new(compile(source)?);
        tracing::debug!(checksum = %key, "Compiled step logic");
        entries.put(key, Arc::clone(&compiled) as Compiled);
        Ok(compiled)
    }

    /// Cached artifact for `source`, if present with type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, source: &str) -> Option<Arc<T>> {
        let key = Self::checksum(source);
        let mut entries = self.entries.lock();
        entries
            .get(&key)
            .and_then(|hit| Arc::clone(hit).downcast::<T>().ok())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
