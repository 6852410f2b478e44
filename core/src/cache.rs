//! The read-through query cache.
//!
//! Entries are keyed by a fingerprint of the whole read request and stamped
//! with the model's generation at write time. Any write operation bumps the
//! model's generation, so stale entries die logically — no sweep, the next
//! access discards them. Backend faults are non-fatal: the engine treats
//! them as misses.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
#[error("cache backend error: {0}")]
pub struct CacheError(pub String);

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// The uniformly suspendable cache surface. Implementations wrapping a
/// synchronous store simply never await; callers always may.
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn get(&self, model: &str, fingerprint: &str) -> CacheResult<Option<serde_json::Value>>;

    async fn put(
        &self,
        model: &str,
        fingerprint: &str,
        payload: serde_json::Value,
    ) -> CacheResult<()>;

    /// Bumps the model's generation, logically invalidating all of its
    /// entries.
    async fn invalidate_model(&self, model: &str) -> CacheResult<()>;

    async fn clear(&self) -> CacheResult<()>;
}

/// Computes the cache key for a read request. Everything that shapes the
/// result participates: model, operation, the canonical filter, bound
/// parameters, projection and ordering.
pub fn fingerprint(
    model: &str,
    operation: &str,
    canonical_filter: &str,
    parameters: &[String],
    columns: &[String],
    order_by: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(operation.as_bytes());
    hasher.update([0]);
    hasher.update(canonical_filter.as_bytes());
    hasher.update([0]);
    for parameter in parameters {
        hasher.update(parameter.as_bytes());
        hasher.update([1]);
    }
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update([2]);
    }
    hasher.update(order_by.as_bytes());

    hex::encode(hasher.finalize())
}

struct Entry {
    payload: serde_json::Value,
    created: Instant,
    generation: u64,
}

struct CacheState {
    entries: LruCache<String, Entry>,
    generations: HashMap<String, u64>,
}

/// The built-in in-process cache: LRU with TTL and per-model generations.
pub struct InMemoryCache {
    state: Mutex<CacheState>,
    ttl: Duration,
}

impl InMemoryCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(max_size.max(1)),
                generations: HashMap::new(),
            }),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self, model: &str) -> u64 {
        self.state.lock().generations.get(model).copied().unwrap_or(0)
    }

    fn key(model: &str, fingerprint: &str) -> String {
        format!("{model}\u{1}{fingerprint}")
    }
}

#[async_trait]
impl QueryCache for InMemoryCache {
    async fn get(&self, model: &str, fingerprint: &str) -> CacheResult<Option<serde_json::Value>> {
        let mut state = self.state.lock();
        let current_generation = state.generations.get(model).copied().unwrap_or(0);
        let key = Self::key(model, fingerprint);

        let stale = match state.entries.get(&key) {
            None => return Ok(None),
            Some(entry) => {
                entry.generation < current_generation || entry.created.elapsed() > self.ttl
            }
        };

        if stale {
            state.entries.pop(&key);
            return Ok(None);
        }

        Ok(state.entries.get(&key).map(|e| e.payload.clone()))
    }

    async fn put(
        &self,
        model: &str,
        fingerprint: &str,
        payload: serde_json::Value,
    ) -> CacheResult<()> {
        let mut state = self.state.lock();
        let generation = state.generations.get(model).copied().unwrap_or(0);

        state.entries.put(
            Self::key(model, fingerprint),
            Entry {
                payload,
                created: Instant::now(),
                generation,
            },
        );

        Ok(())
    }

    async fn invalidate_model(&self, model: &str) -> CacheResult<()> {
        let mut state = self.state.lock();
        *state.generations.entry(model.to_owned()).or_insert(0) += 1;
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.generations.clear();
        Ok(())
    }
}

/// A cache that always misses; used when caching is disabled.
pub struct DisabledCache;

#[async_trait]
impl QueryCache for DisabledCache {
    async fn get(&self, _model: &str, _fingerprint: &str) -> CacheResult<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn put(
        &self,
        _model: &str,
        _fingerprint: &str,
        _payload: serde_json::Value,
    ) -> CacheResult<()> {
        Ok(())
    }

    async fn invalidate_model(&self, _model: &str) -> CacheResult<()> {
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        Ok(())
    }
}
