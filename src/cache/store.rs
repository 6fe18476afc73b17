//! Cache Store - weighted, bounded chunk map
//!
//! Sharded map from [`ChunkKey`] to loaded [`ChunkBuffer`]s, bounded by the
//! summed capacity of the buffers it holds.
//!
//! # Design
//!
//! - Hits take a single shard read lock; there is no global lock on the read path
//! - Misses are single-flight: the first thread installs a loading slot, every
//!   other thread asking for the same key waits for its result
//! - Approximate LRU eviction driven by a global clock that only insertions
//!   advance; hits stamp the current value, so the read path never writes
//!   to shared state
//! - Every removal (eviction, invalidation, a load that lost its slot) goes
//!   through [`CacheStore::on_removal`], which drops the store's reference once

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::buffer::ChunkBuffer;
use super::key::ChunkKey;
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot, RemovalCause};
use super::policy::EvictionPolicy;
use super::shard::ShardedMap;
use super::DEFAULT_SHARD_COUNT;
use crate::error::{Error, Result};
use crate::io::BufferPool;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum summed buffer capacity in bytes
    pub capacity: u64,
    /// Number of shards (rounded up to a power of two)
    pub shard_count: usize,
    /// Allocate buffers rounded up to the next power of two
    pub round_up: bool,
    /// Eviction policy
    pub eviction: EvictionPolicy,
}

impl StoreConfig {
    /// Configuration with default tuning for the given capacity
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            shard_count: DEFAULT_SHARD_COUNT,
            round_up: false,
            eviction: EvictionPolicy::default(),
        }
    }
}

// =============================================================================
// Slots
// =============================================================================

/// A resident chunk and its bookkeeping
struct Resident {
    buffer: Arc<ChunkBuffer>,
    weight: u64,
    last_access: AtomicU64,
}

/// Result slot shared by the loading thread and its waiters
struct PendingLoad {
    result: Mutex<Option<Result<Arc<ChunkBuffer>>>>,
    ready: Condvar,
}

impl PendingLoad {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<Arc<ChunkBuffer>>) {
        *self.result.lock() = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<Arc<ChunkBuffer>> {
        let mut result = self.result.lock();
        loop {
            if let Some(done) = result.as_ref() {
                return done.clone();
            }
            self.ready.wait(&mut result);
        }
    }
}

enum Slot {
    Resident(Resident),
    Loading(Arc<PendingLoad>),
}

/// Outcome of looking a key up under a shard lock
enum Lookup {
    Hit(Arc<ChunkBuffer>),
    Wait(Arc<PendingLoad>),
    Load(Arc<PendingLoad>),
}

/// Publishes `LoadAbandoned` if the loader unwinds before completing
struct LoadGuard<'a> {
    store: &'a CacheStore,
    key: &'a ChunkKey,
    pending: &'a Arc<PendingLoad>,
    armed: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(key = %self.key, "chunk load abandoned");
        self.store.clear_pending(self.key, self.pending);
        self.pending
            .complete(Err(Error::LoadAbandoned(self.key.to_string())));
    }
}

// =============================================================================
// Store
// =============================================================================

/// Weighted, bounded, sharded chunk store
pub struct CacheStore {
    map: ShardedMap<ChunkKey, Slot>,
    config: StoreConfig,
    pool: Arc<dyn BufferPool>,
    /// Sum of resident buffer capacities
    weighted_size: AtomicU64,
    /// Insertion clock for LRU ordering
    clock: AtomicU64,
    /// Serializes eviction passes
    eviction_lock: Mutex<()>,
    metrics: CacheMetrics,
}

impl CacheStore {
    /// Create an empty store allocating from `pool`
    pub fn new(config: StoreConfig, pool: Arc<dyn BufferPool>) -> Self {
        Self {
            map: ShardedMap::new(config.shard_count),
            config,
            pool,
            weighted_size: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            metrics: CacheMetrics::new(),
        }
    }

    /// Return the resident buffer for `key`, reading it through the key's
    /// reader on a miss
    pub fn get_or_load(&self, key: &ChunkKey) -> Result<Arc<ChunkBuffer>> {
        self.get_or_load_with(key, |key| {
            ChunkBuffer::load(
                key.reader().as_ref(),
                key.position(),
                &self.pool,
                self.config.round_up,
            )
        })
    }

    /// Like [`get_or_load`](Self::get_or_load) with a custom loader.
    ///
    /// At most one loader runs per key at a time; concurrent callers for the
    /// same key receive the loader's result, error included. The loader is
    /// never retried by the store.
    pub fn get_or_load_with<F>(&self, key: &ChunkKey, loader: F) -> Result<Arc<ChunkBuffer>>
    where
        F: FnOnce(&ChunkKey) -> Result<ChunkBuffer>,
    {
        let shard = self.map.shard(key);

        // Fast path: shared lock only
        let found = match shard.read().get(key) {
            Some(Slot::Resident(resident)) => Some(Lookup::Hit(self.touch(resident))),
            Some(Slot::Loading(pending)) => Some(Lookup::Wait(Arc::clone(pending))),
            None => None,
        };

        let lookup = match found {
            Some(lookup) => lookup,
            None => {
                let mut map = shard.write();
                match map.get(key) {
                    Some(Slot::Resident(resident)) => Lookup::Hit(self.touch(resident)),
                    Some(Slot::Loading(pending)) => Lookup::Wait(Arc::clone(pending)),
                    None => {
                        let pending = Arc::new(PendingLoad::new());
                        map.insert(key.clone(), Slot::Loading(Arc::clone(&pending)));
                        Lookup::Load(pending)
                    }
                }
            }
        };

        match lookup {
            Lookup::Hit(buffer) => {
                self.metrics.record_hit();
                Ok(buffer)
            }
            Lookup::Wait(pending) => {
                self.metrics.record_hit();
                pending.wait()
            }
            Lookup::Load(pending) => {
                self.metrics.record_miss();
                self.load(key, &pending, loader)
            }
        }
    }

    fn load<F>(&self, key: &ChunkKey, pending: &Arc<PendingLoad>, loader: F) -> Result<Arc<ChunkBuffer>>
    where
        F: FnOnce(&ChunkKey) -> Result<ChunkBuffer>,
    {
        let mut guard = LoadGuard {
            store: self,
            key,
            pending,
            armed: true,
        };
        let tracker = LatencyTracker::start();
        let result = loader(key);
        guard.armed = false;

        match result {
            Ok(buffer) => {
                self.metrics.record_load_success(tracker.elapsed());
                let buffer = Arc::new(buffer);
                let weight = buffer.capacity() as u64;
                debug!(key = %key, weight, "loaded chunk");

                let inserted = {
                    let mut map = self.map.shard(key).write();
                    let owned = matches!(
                        map.get(key),
                        Some(Slot::Loading(current)) if Arc::ptr_eq(current, pending)
                    );
                    if owned {
                        map.insert(
                            key.clone(),
                            Slot::Resident(Resident {
                                buffer: Arc::clone(&buffer),
                                weight,
                                last_access: AtomicU64::new(self.tick()),
                            }),
                        );
                        self.weighted_size.fetch_add(weight, Ordering::AcqRel);
                    }
                    owned
                };

                pending.complete(Ok(Arc::clone(&buffer)));
                if inserted {
                    self.evict_if_needed();
                } else {
                    // Invalidated while loading: hand it to the waiters, but
                    // drop the store's reference so nobody can keep using it.
                    self.on_removal(key, &buffer, RemovalCause::Replaced);
                }
                Ok(buffer)
            }
            Err(e) => {
                self.metrics.record_load_failure(tracker.elapsed());
                if e.is_corruption() {
                    warn!(key = %key, error = %e, "corrupted chunk");
                } else {
                    debug!(key = %key, error = %e, "chunk load failed");
                }
                self.clear_pending(key, pending);
                pending.complete(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Remove `pending`'s slot if it still owns the key
    fn clear_pending(&self, key: &ChunkKey, pending: &Arc<PendingLoad>) {
        let mut map = self.map.shard(key).write();
        if matches!(map.get(key), Some(Slot::Loading(current)) if Arc::ptr_eq(current, pending)) {
            map.remove(key);
        }
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    fn touch(&self, resident: &Resident) -> Arc<ChunkBuffer> {
        let now = self.clock.load(Ordering::Relaxed);
        if resident.last_access.load(Ordering::Relaxed) < now {
            resident.last_access.store(now, Ordering::Relaxed);
        }
        Arc::clone(&resident.buffer)
    }

    /// Remove `key`; a load in progress for it will not be inserted
    pub fn invalidate(&self, key: &ChunkKey) -> bool {
        let removed = self.map.shard(key).write().remove(key);
        match removed {
            Some(Slot::Resident(resident)) => {
                self.weighted_size
                    .fetch_sub(resident.weight, Ordering::AcqRel);
                self.on_removal(key, &resident.buffer, RemovalCause::Explicit);
                true
            }
            Some(Slot::Loading(_)) | None => false,
        }
    }

    /// Remove every key matching `predicate`, returning the number of
    /// resident entries removed
    pub fn invalidate_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&ChunkKey) -> bool,
    {
        let mut removed = Vec::new();
        for shard in self.map.shards() {
            let mut map = shard.write();
            let keys: Vec<ChunkKey> = map.keys().filter(|k| predicate(k)).cloned().collect();
            for key in keys {
                if let Some(Slot::Resident(resident)) = map.remove(&key) {
                    self.weighted_size
                        .fetch_sub(resident.weight, Ordering::AcqRel);
                    removed.push((key, resident.buffer));
                }
            }
        }

        for (key, buffer) in &removed {
            self.on_removal(key, buffer, RemovalCause::Explicit);
        }
        removed.len()
    }

    /// Remove everything
    pub fn invalidate_all(&self) -> usize {
        self.invalidate_matching(|_| true)
    }

    /// Evict least recently used entries while over capacity
    pub fn evict_if_needed(&self) {
        if self.weighted_size() <= self.config.capacity {
            return;
        }

        let _guard = self.eviction_lock.lock();
        let target = self.config.eviction.target_weight(self.config.capacity);

        while self.weighted_size() > target {
            let mut candidates: Vec<(u64, ChunkKey, Arc<ChunkBuffer>)> = Vec::new();
            for shard in self.map.shards() {
                for (key, slot) in shard.read().iter() {
                    if let Slot::Resident(resident) = slot {
                        candidates.push((
                            resident.last_access.load(Ordering::Relaxed),
                            key.clone(),
                            Arc::clone(&resident.buffer),
                        ));
                    }
                }
            }
            if candidates.is_empty() {
                break;
            }

            candidates.sort_unstable_by_key(|(tick, _, _)| *tick);
            candidates.truncate(self.config.eviction.batch_size);

            let mut evicted = 0;
            for (_, key, buffer) in candidates {
                if self.weighted_size() <= target {
                    break;
                }
                if self.evict_entry(&key, &buffer) {
                    evicted += 1;
                }
            }
            if evicted == 0 {
                break;
            }
        }
    }

    /// Remove `key` only if it still holds `buffer`
    fn evict_entry(&self, key: &ChunkKey, buffer: &Arc<ChunkBuffer>) -> bool {
        let removed = {
            let mut map = self.map.shard(key).write();
            let current = matches!(
                map.get(key),
                Some(Slot::Resident(resident)) if Arc::ptr_eq(&resident.buffer, buffer)
            );
            if current {
                map.remove(key)
            } else {
                None
            }
        };

        match removed {
            Some(Slot::Resident(resident)) => {
                self.weighted_size
                    .fetch_sub(resident.weight, Ordering::AcqRel);
                self.on_removal(key, &resident.buffer, RemovalCause::Size);
                true
            }
            _ => false,
        }
    }

    /// Single exit point of a buffer from the store: drops the store's reference
    fn on_removal(&self, key: &ChunkKey, buffer: &ChunkBuffer, cause: RemovalCause) {
        self.metrics.record_removal(cause);
        debug!(key = %key, %cause, weight = buffer.capacity(), "removed chunk");
        buffer.release();
    }

    /// Number of resident entries
    pub fn size(&self) -> usize {
        self.map
            .shards()
            .map(|s| {
                s.read()
                    .values()
                    .filter(|slot| matches!(slot, Slot::Resident(_)))
                    .count()
            })
            .sum()
    }

    /// Summed capacity of resident buffers
    pub fn weighted_size(&self) -> u64 {
        self.weighted_size.load(Ordering::Acquire)
    }

    /// Maximum weighted size
    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    /// Pool chunk buffers are allocated from
    pub fn pool(&self) -> &Arc<dyn BufferPool> {
        &self.pool
    }

    /// Counters
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Counters together with current occupancy
    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.size() as u64, self.weighted_size(), self.capacity())
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.invalidate_all();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;

    use crate::io::{
        BufferKind, Channel, ChunkReader, MemoryChannel, SimpleChunkReader, TrackingBufferPool,
    };

    const CHUNK: usize = 1024;

    struct Fixture {
        pool: Arc<TrackingBufferPool>,
        store: Arc<CacheStore>,
        reader: Arc<dyn ChunkReader>,
    }

    fn fixture(capacity: u64) -> Fixture {
        let pool = Arc::new(TrackingBufferPool::default());
        let dyn_pool: Arc<dyn BufferPool> = pool.clone();
        let mut config = StoreConfig::with_capacity(capacity);
        config.eviction = EvictionPolicy::strict();
        config.shard_count = 4;
        let store = Arc::new(CacheStore::new(config, dyn_pool));

        let data: Vec<u8> = (0..CHUNK * 16).map(|i| (i / CHUNK) as u8).collect();
        let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new("/data/t-Data.db", data));
        let reader: Arc<dyn ChunkReader> = Arc::new(SimpleChunkReader::new(channel, CHUNK).unwrap());
        Fixture { pool, store, reader }
    }

    fn buffer_from(pool: &Arc<TrackingBufferPool>, fill: u8, offset: u64) -> ChunkBuffer {
        let mut data = pool.acquire(CHUNK, BufferKind::Standard).unwrap();
        data.resize(CHUNK, fill);
        let dyn_pool: Arc<dyn BufferPool> = pool.clone();
        ChunkBuffer::new(data, offset, dyn_pool)
    }

    #[test]
    fn test_load_then_hit() {
        let f = fixture(8 * CHUNK as u64);
        let key = ChunkKey::new(Arc::clone(&f.reader), 2 * CHUNK as u64);

        let first = f.store.get_or_load(&key).unwrap();
        let second = f.store.get_or_load(&key).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.reference().unwrap().bytes()[0], 2);

        assert_eq!(f.store.size(), 1);
        assert_eq!(f.store.weighted_size(), first.capacity() as u64);
        assert_eq!(f.store.metrics().misses(), 1);
        assert_eq!(f.store.metrics().hits(), 1);
    }

    #[test]
    fn test_single_flight() {
        let f = fixture(8 * CHUNK as u64);
        let key = ChunkKey::new(Arc::clone(&f.reader), 0);
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&f.store);
                let pool = Arc::clone(&f.pool);
                let key = key.clone();
                let loads = Arc::clone(&loads);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .get_or_load_with(&key, |_| {
                            loads.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(buffer_from(&pool, 7, 0))
                        })
                        .unwrap()
                })
            })
            .collect();

        let buffers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(buffers.iter().all(|b| Arc::ptr_eq(b, &buffers[0])));
        assert_eq!(f.pool.acquired(), 1);
    }

    #[test]
    fn test_load_error_reaches_waiters() {
        let f = fixture(8 * CHUNK as u64);
        let key = ChunkKey::new(Arc::clone(&f.reader), 0);
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&f.store);
                let key = key.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.get_or_load_with(&key, |k| {
                        thread::sleep(Duration::from_millis(50));
                        Err(Error::corruption(k.path(), k.position(), "bad checksum"))
                    })
                })
            })
            .collect();

        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(err.is_corruption());
        }
        assert_eq!(f.store.size(), 0);
        assert_eq!(f.store.weighted_size(), 0);
    }

    #[test]
    fn test_eviction_keeps_weight_within_capacity() {
        let f = fixture(4 * CHUNK as u64);

        for i in 0..10u64 {
            let key = ChunkKey::new(Arc::clone(&f.reader), i * CHUNK as u64);
            f.store
                .get_or_load_with(&key, |k| Ok(buffer_from(&f.pool, i as u8, k.position())))
                .unwrap();
            assert!(f.store.weighted_size() <= f.store.capacity());
        }

        assert_eq!(f.store.size(), 4);
        assert_eq!(f.store.metrics().evictions(RemovalCause::Size), 6);
        assert_eq!(f.pool.outstanding(), 4);
    }

    #[test]
    fn test_eviction_prefers_least_recently_used() {
        let f = fixture(2 * CHUNK as u64);
        let k0 = ChunkKey::new(Arc::clone(&f.reader), 0);
        let k1 = k0.at(CHUNK as u64);
        let k2 = k0.at(2 * CHUNK as u64);

        f.store.get_or_load(&k0).unwrap();
        f.store.get_or_load(&k1).unwrap();
        f.store.get_or_load(&k0).unwrap();
        f.store.get_or_load(&k2).unwrap();

        assert_eq!(f.store.size(), 2);
        assert_eq!(f.store.metrics().misses(), 3);
        f.store.get_or_load(&k0).unwrap();
        assert_eq!(f.store.metrics().misses(), 3);
    }

    #[test]
    fn test_hits_leave_clock_alone() {
        let f = fixture(8 * CHUNK as u64);
        let key = ChunkKey::new(Arc::clone(&f.reader), 0);
        f.store.get_or_load(&key).unwrap();
        let clock = f.store.clock.load(Ordering::Relaxed);

        for _ in 0..100 {
            f.store.get_or_load(&key).unwrap();
        }
        assert_eq!(f.store.clock.load(Ordering::Relaxed), clock);
        assert_eq!(f.store.metrics().hits(), 100);
    }

    #[test]
    fn test_round_up_weighs_final_chunk() {
        let data = vec![1u8; 10_000];
        let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new("/data/w-Data.db", data));
        let reader: Arc<dyn ChunkReader> = Arc::new(SimpleChunkReader::new(channel, 4096).unwrap());
        let last = ChunkKey::new(reader, 8192);

        for (round_up, weight) in [(false, 1808), (true, 2048)] {
            let pool: Arc<dyn BufferPool> = Arc::new(TrackingBufferPool::default());
            let mut config = StoreConfig::with_capacity(1 << 20);
            config.round_up = round_up;
            let store = CacheStore::new(config, pool);

            let buffer = store.get_or_load(&last).unwrap();
            assert_eq!(store.weighted_size(), weight);
            assert_eq!(buffer.reference().unwrap().len(), 1808);
        }
    }

    #[test]
    fn test_invalidate_releases_store_reference() {
        let f = fixture(8 * CHUNK as u64);
        let key = ChunkKey::new(Arc::clone(&f.reader), 0);

        let buffer = f.store.get_or_load(&key).unwrap();
        let handle = buffer.reference().unwrap();
        assert!(f.store.invalidate(&key));
        assert!(!f.store.invalidate(&key));

        assert_eq!(f.pool.outstanding(), 1);
        assert_eq!(handle.bytes()[0], 0);
        drop(handle);
        assert_eq!(f.pool.outstanding(), 0);
        assert!(buffer.reference().is_none());
    }

    #[test]
    fn test_invalidate_during_load_is_not_inserted() {
        let f = fixture(8 * CHUNK as u64);
        let key = ChunkKey::new(Arc::clone(&f.reader), 0);
        let (started_tx, started_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();

        let loader = {
            let store = Arc::clone(&f.store);
            let pool = Arc::clone(&f.pool);
            let key = key.clone();
            thread::spawn(move || {
                store
                    .get_or_load_with(&key, |_| {
                        started_tx.send(()).unwrap();
                        resume_rx.recv().unwrap();
                        Ok(buffer_from(&pool, 1, 0))
                    })
                    .unwrap()
            })
        };

        started_rx.recv().unwrap();
        assert!(!f.store.invalidate(&key));
        resume_tx.send(()).unwrap();

        let buffer = loader.join().unwrap();
        assert_eq!(buffer.references(), 0);
        assert!(buffer.reference().is_none());
        assert_eq!(f.store.size(), 0);
        assert_eq!(f.pool.outstanding(), 0);
        assert_eq!(f.store.metrics().evictions(RemovalCause::Replaced), 1);
    }

    #[test]
    fn test_panicking_loader_abandons_waiters() {
        let f = fixture(8 * CHUNK as u64);
        let key = ChunkKey::new(Arc::clone(&f.reader), 0);
        let (started_tx, started_rx) = mpsc::channel();

        let loader = {
            let store = Arc::clone(&f.store);
            let key = key.clone();
            thread::spawn(move || {
                let _ = store.get_or_load_with(&key, |_| {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(200));
                    panic!("loader failed");
                });
            })
        };

        started_rx.recv().unwrap();
        let result = f
            .store
            .get_or_load_with(&key, |_| Ok(buffer_from(&f.pool, 0, 0)));
        assert!(matches!(result, Err(Error::LoadAbandoned(_))));
        assert!(loader.join().is_err());

        // Slot was cleared; the next request loads afresh
        assert!(f.store.get_or_load(&key).is_ok());
    }

    #[test]
    fn test_invalidate_matching_and_drop() {
        let f = fixture(16 * CHUNK as u64);
        let key = ChunkKey::new(Arc::clone(&f.reader), 0);
        for i in 0..6u64 {
            f.store.get_or_load(&key.at(i * CHUNK as u64)).unwrap();
        }

        let removed = f
            .store
            .invalidate_matching(|k| k.position() % (2 * CHUNK as u64) == 0);
        assert_eq!(removed, 3);
        assert_eq!(f.store.size(), 3);

        let pool = Arc::clone(&f.pool);
        drop(f);
        assert_eq!(pool.outstanding(), 0);
    }
}
