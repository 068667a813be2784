//! Request-id → connection correlation cache.
//!
//! Bounded, sharded LRU with idle expiry. Each shard is a
//! `parking_lot::Mutex<LruCache>`; a request id always maps to the same
//! shard, so `put` from connection tasks and `get` from the dispatcher only
//! contend when they hit the same stripe. Critical sections never await.
//!
//! Capacity is split evenly across shards (rounded up) and LRU order is kept
//! per shard. Expiry is measured from the last `put` or `get` of an entry on
//! the tokio clock, so paused-time tests can drive it.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use relay_core::RequestId;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::CorrelationConfig;

struct Entry<V> {
    value: V,
    last_access: Instant,
}

/// Bounded, time-expiring map from request id to a connection handle.
pub struct CorrelationCache<V> {
    shards: Box<[Mutex<LruCache<RequestId, Entry<V>>>]>,
    idle_expiry: Duration,
    capacity: usize,
}

impl<V: Clone> CorrelationCache<V> {
    /// Create a cache from its configuration.
    pub fn new(config: &CorrelationConfig) -> Self {
        let shard_count = config.shards.max(1);
        let per_shard = NonZeroUsize::new(config.capacity.max(1).div_ceil(shard_count))
            .unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self {
            shards,
            idle_expiry: config.idle_expiry,
            capacity: per_shard.get() * shard_count,
        }
    }

    /// Store `value` for `id`, replacing any previous mapping.
    pub fn put(&self, id: RequestId, value: V) {
        let now = Instant::now();
        let mut shard = self.shard(id).lock();

        if !shard.contains(&id) && shard.len() == shard.cap().get() {
            while shard
                .peek_lru()
                .is_some_and(|(_, entry)| self.is_expired(entry, now))
            {
                let _ = shard.pop_lru();
            }
        }

        let entry = Entry {
            value,
            last_access: now,
        };
        match shard.push(id, entry) {
            Some((old, _)) if old == id => debug!(request_id = %id, "request id reused, mapping replaced"),
            Some((evicted, _)) => debug!(request_id = %id, evicted = %evicted, "cache full, evicted least recently used"),
            None => {}
        }
    }

    /// Look up the value stored for `id` and refresh its expiry.
    ///
    /// Returns `None` when the id was never stored, was evicted, or has been
    /// idle for longer than the expiry window.
    pub fn get(&self, id: RequestId) -> Option<V> {
        let now = Instant::now();
        let mut shard = self.shard(id).lock();

        let entry = shard.get_mut(&id)?;
        if now.saturating_duration_since(entry.last_access) < self.idle_expiry {
            entry.last_access = now;
            return Some(entry.value.clone());
        }

        let _ = shard.pop(&id);
        trace!(request_id = %id, "correlation expired");
        None
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &*self.shards {
            let mut shard = shard.lock();
            let expired: Vec<RequestId> = shard
                .iter()
                .filter(|(_, entry)| self.is_expired(entry, now))
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                let _ = shard.pop(&id);
                removed += 1;
            }
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Effective capacity (per-shard capacity times shard count).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Idle window after which an entry expires.
    pub fn idle_expiry(&self) -> Duration {
        self.idle_expiry
    }

    fn shard(&self, id: RequestId) -> &Mutex<LruCache<RequestId, Entry<V>>> {
        #[allow(clippy::cast_possible_truncation)]
        let idx = (id.get().unsigned_abs() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_access) >= self.idle_expiry
    }
}

impl<V: Clone + Send + 'static> CorrelationCache<V> {
    /// Periodically purge expired entries until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.purge_expired();
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "purged expired correlations");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}
