//! TTL- and size-bounded cache with single-flight computation
//!
//! Entries expire lazily: a read past the entry's TTL treats it as absent
//! and removes it. Writes that push the cache over capacity first drop
//! expired entries, then evict least-recently-accessed ones until the
//! cache is back within bounds.
//!
//! [`Cache::get_or_compute`] runs at most one producer per key at a time.
//! Concurrent callers for the same missing key wait for that producer and
//! share its value, or its failure. Failures are never cached.
//!
//! Every invalidation bumps an epoch under the entry lock and detaches the
//! matching in-flight producers. A producer only stores its value if the
//! epoch is unchanged since it started, so data fetched before a logout
//! never survives it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::{Error, Result};

/// Outcome published by a producer to the callers waiting on it
type Outcome<V> = std::result::Result<V, Arc<Error>>;

/// A cached value with TTL and recency metadata
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    last_access: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    computations: AtomicU64,
}

impl CacheStats {
    /// Calculate hit rate as a fraction (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Reads served from the cache
    pub hits: u64,
    /// Reads that found nothing live
    pub misses: u64,
    /// Entries dropped to stay within capacity
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Producer invocations made by `get_or_compute`
    pub computations: u64,
    /// Current number of entries (live or not yet swept)
    pub size: usize,
    /// Configured capacity
    pub capacity: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

/// In-flight producers by key; the id tells a detached flight from its successor
type Inflight<K, V> = Mutex<HashMap<K, (u64, watch::Receiver<Option<Outcome<V>>>)>>;

/// Thread-safe TTL + LRU cache
pub struct Cache<K, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    inflight: Inflight<K, V>,
    epoch: AtomicU64,
    next_flight: AtomicU64,
    capacity: usize,
    default_ttl: Duration,
    stats: CacheStats,
}

impl<K: Hash + Eq, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("capacity", &self.capacity)
            .field("default_ttl", &self.default_ttl)
            .field("size", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + fmt::Display,
    V: Clone,
{
    /// Create a cache from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero capacity or TTL.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        Self::with_capacity(config.capacity, config.default_ttl)
    }

    /// Create a cache holding at most `capacity` entries
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero capacity or TTL.
    pub fn with_capacity(capacity: usize, default_ttl: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("cache capacity must be positive".into()));
        }
        if default_ttl.is_zero() {
            return Err(Error::Config("cache TTL must be positive".into()));
        }
        Ok(Self {
            entries: Mutex::new(LruCache::unbounded()),
            inflight: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            next_flight: AtomicU64::new(0),
            capacity,
            default_ttl,
            stats: CacheStats::default(),
        })
    }

    /// TTL applied by [`Cache::put_default`]
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get a live entry, marking it most recently used
    ///
    /// Returns `None` if the key is absent or its TTL has elapsed; expired
    /// entries are removed on the way.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_access = now;
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache entry expired");
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Whether a live entry exists, without touching recency or stats
    pub fn contains(&self, key: &K) -> bool {
        self.peek_live(key).is_some()
    }

    fn peek_live(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Time since `key` was last read or written, if it is live
    pub fn idle_time(&self, key: &K) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| now.duration_since(entry.last_access))
    }

    /// Insert or overwrite `key`, evicting least-recently-used entries if
    /// the cache grows past capacity
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.lock();
        self.insert_locked(&mut entries, key, value, ttl);
    }

    /// Store a producer's value unless an invalidation ran since `started`.
    /// Returns whether it was stored.
    fn put_if_current(&self, started: u64, key: K, value: V, ttl: Duration) -> bool {
        let mut entries = self.entries.lock();
        if self.epoch.load(Ordering::Acquire) != started {
            return false;
        }
        self.insert_locked(&mut entries, key, value, ttl);
        true
    }

    fn insert_locked(
        &self,
        entries: &mut LruCache<K, CacheEntry<V>>,
        key: K,
        value: V,
        ttl: Duration,
    ) {
        let now = Instant::now();
        entries.put(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                ttl,
                last_access: now,
            },
        );

        if entries.len() > self.capacity {
            self.purge_expired(entries, now);
        }
        while entries.len() > self.capacity {
            let Some((evicted, _)) = entries.pop_lru() else {
                break;
            };
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %evicted, "Cache eviction (capacity)");
        }
    }

    /// Insert with the cache's default TTL
    pub fn put_default(&self, key: K, value: V) {
        self.put(key, value, self.default_ttl);
    }

    /// Remove a single entry. Returns whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            entries.pop(key).is_some()
        };
        self.inflight.lock().remove(key);
        removed
    }

    /// Remove every entry whose key satisfies `matches`. Returns the count.
    pub fn invalidate_matching<F>(&self, matches: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let count = {
            let mut entries = self.entries.lock();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            let doomed: Vec<K> = entries
                .iter()
                .filter(|(key, _)| matches(key))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &doomed {
                entries.pop(key);
            }
            doomed.len()
        };
        self.inflight.lock().retain(|key, _| !matches(key));
        count
    }

    /// Remove all entries. Returns the count.
    pub fn clear(&self) -> usize {
        let count = {
            let mut entries = self.entries.lock();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            let count = entries.len();
            entries.clear();
            count
        };
        self.inflight.lock().clear();
        count
    }

    /// Drop every expired entry. Returns the count.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        self.purge_expired(&mut entries, Instant::now())
    }

    fn purge_expired(&self, entries: &mut LruCache<K, CacheEntry<V>>, now: Instant) -> usize {
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            self.stats
                .expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!(count = expired.len(), "Purged expired cache entries");
        }
        expired.len()
    }

    /// Number of stored entries, including expired ones not yet removed
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            computations: self.stats.computations.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
            hit_rate: self.stats.hit_rate(),
        }
    }

    /// Return the live value for `key`, or run `producer`, store its value
    /// with `ttl` and return it.
    ///
    /// At most one producer runs per key at a time. Callers arriving while a
    /// producer is running wait for it and receive the same value or the same
    /// failure. If the running producer is cancelled, waiters start over and
    /// one of them becomes the next producer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheProducerFailed`] wrapping the producer's failure.
    pub async fn get_or_compute<F, Fut>(&self, key: K, ttl: Duration, producer: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut producer = Some(producer);

        loop {
            if let Some(value) = self.get(&key) {
                return Ok(value);
            }

            let role = {
                let mut inflight = self.inflight.lock();
                if let Some((_, rx)) = inflight.get(&key) {
                    Role::Waiter(rx.clone())
                } else if let Some(value) = self.peek_live(&key) {
                    // A producer finished between the first read and taking the lock
                    return Ok(value);
                } else {
                    let (tx, rx) = watch::channel(None);
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    inflight.insert(key.clone(), (id, rx));
                    Role::Leader { id, tx }
                }
            };

            match role {
                Role::Waiter(mut rx) => {
                    debug!(key = %key, "Waiting for in-flight producer");
                    let outcome = rx
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|published| (*published).clone());
                    match outcome {
                        Some(Ok(value)) => return Ok(value),
                        Some(Err(source)) => {
                            return Err(Error::CacheProducerFailed {
                                key: key.to_string(),
                                source,
                            });
                        }
                        // Producer was dropped before finishing
                        None => {}
                    }
                }
                Role::Leader { id, tx } => {
                    let started = self.epoch.load(Ordering::Acquire);
                    let guard = InflightGuard {
                        inflight: &self.inflight,
                        key: key.clone(),
                        id,
                        tx,
                    };
                    let Some(produce) = producer.take() else {
                        return Err(Error::Internal("producer already consumed".into()));
                    };

                    self.stats.computations.fetch_add(1, Ordering::Relaxed);
                    return match produce().await {
                        Ok(value) => {
                            if !self.put_if_current(started, key.clone(), value.clone(), ttl) {
                                debug!(key = %key, "Cache invalidated while producing, value not stored");
                            }
                            guard.publish(Ok(value.clone()));
                            Ok(value)
                        }
                        Err(e) => {
                            let source = Arc::new(e);
                            debug!(key = %key, error = %source, "Cache producer failed");
                            guard.publish(Err(Arc::clone(&source)));
                            Err(Error::CacheProducerFailed {
                                key: key.to_string(),
                                source,
                            })
                        }
                    };
                }
            }
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Spawn a background task that drops expired entries every `interval`.
    ///
    /// The task ends once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                cache.evict_expired();
            }
        })
    }
}

enum Role<V> {
    Leader {
        id: u64,
        tx: watch::Sender<Option<Outcome<V>>>,
    },
    Waiter(watch::Receiver<Option<Outcome<V>>>),
}

/// Removes the in-flight marker when the producing caller finishes or is
/// dropped; dropping the sender wakes any waiters.
struct InflightGuard<'a, K: Hash + Eq, V> {
    inflight: &'a Inflight<K, V>,
    key: K,
    id: u64,
    tx: watch::Sender<Option<Outcome<V>>>,
}

impl<K: Hash + Eq, V> InflightGuard<'_, K, V> {
    fn publish(self, outcome: Outcome<V>) {
        self.tx.send_replace(Some(outcome));
    }
}

impl<K: Hash + Eq, V> Drop for InflightGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        // A detached flight must not remove its successor
        if inflight.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            inflight.remove(&self.key);
        }
    }
}
