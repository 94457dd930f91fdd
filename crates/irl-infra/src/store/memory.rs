//! In-memory bucket store - single-process fallback and test double.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use irl_core::domain::{BucketRequest, ConsumeOutcome, StoredState};
use irl_core::ports::{BucketStore, StoreError};

/// Writes between sweeps of expired entries.
const SWEEP_EVERY: u64 = 1024;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory bucket store using a HashMap behind an async RwLock.
///
/// `consume` holds the write lock for the whole read-refill-consume-write
/// cycle, which gives the same per-key atomicity as the Redis script.
/// Expired entries are dropped when read and swept every
/// [`SWEEP_EVERY`] writes, so idle callers do not pile up.
/// Note: limits are per-process, not shared across instances.
pub struct InMemoryBucketStore {
    store: RwLock<HashMap<String, Entry>>,
    writes: AtomicU64,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Count a write; every `SWEEP_EVERY`th one drops all expired entries.
    fn sweep_if_due(&self, store: &mut HashMap<String, Entry>, now: Instant) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY != 0 {
            return;
        }
        let before = store.len();
        store.retain(|_, e| !e.is_expired(now));
        let swept = before - store.len();
        if swept > 0 {
            tracing::debug!(swept, live = store.len(), "Swept expired buckets");
        }
    }

    /// Number of live buckets.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let store = self.store.read().await;
        store.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let store = self.store.read().await;
        match store.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }
        drop(store);

        let mut store = self.store.write().await;
        // Another writer may have refreshed it in between.
        if store.get(key).is_some_and(|e| e.is_expired(now)) {
            store.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut store = self.store.write().await;
        self.sweep_if_due(&mut store, now);
        store.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn consume(
        &self,
        key: &str,
        request: BucketRequest,
    ) -> Result<ConsumeOutcome, StoreError> {
        let now = Instant::now();
        let mut store = self.store.write().await;

        let stored = store
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.as_str());

        let applied = request
            .apply(stored)
            .map_err(|e| StoreError::Protocol(e.to_string()))?;

        if applied.state == StoredState::Recovered {
            tracing::warn!(key = %key, "Malformed bucket state, reinitialized at full capacity");
        }

        self.sweep_if_due(&mut store, now);
        store.insert(
            key.to_string(),
            Entry {
                value: applied.bucket.serialize(),
                expires_at: now + Duration::from_secs(applied.bucket.ttl_secs()),
            },
        );

        Ok(applied.outcome)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
