//! Chunk Cache - the per-process façade
//!
//! Owns configuration, the shared store and the buffer pool binding, and
//! decides for every opened file whether its reads go through the cache.
//! Constructed explicitly and handed to whatever opens data files.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::metrics::MetricsSnapshot;
use super::rebufferer::CachingRebufferer;
use super::store::{CacheStore, StoreConfig};
use crate::config::ChunkCacheConfig;
use crate::error::{Error, Result};
use crate::io::{BufferPool, ChunkReader, RebuffererFactory, UnbufferedRebufferer};

/// Wraps every caching rebufferer [`ChunkCache::maybe_wrap`] hands out
///
/// Installed at construction; each interceptor wraps the result of the
/// previous one.
pub trait RebuffererInterceptor: Send + Sync {
    fn intercept(&self, factory: Arc<dyn RebuffererFactory>) -> Arc<dyn RebuffererFactory>;
}

impl<F> RebuffererInterceptor for F
where
    F: Fn(Arc<dyn RebuffererFactory>) -> Arc<dyn RebuffererFactory> + Send + Sync,
{
    fn intercept(&self, factory: Arc<dyn RebuffererFactory>) -> Arc<dyn RebuffererFactory> {
        self(factory)
    }
}

/// Size accessors of a bounded cache
pub trait CacheSize {
    /// Maximum weighted size in bytes
    fn capacity(&self) -> u64;

    /// Change the capacity
    fn set_capacity(&self, capacity: u64) -> Result<()>;

    /// Number of entries
    fn size(&self) -> usize;

    /// Summed entry weight in bytes
    fn weighted_size(&self) -> u64;
}

struct Inner {
    config: ChunkCacheConfig,
    store: Arc<CacheStore>,
    pool: Arc<dyn BufferPool>,
    enabled: AtomicBool,
    interceptors: Vec<Box<dyn RebuffererInterceptor>>,
}

/// Shared chunk cache
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct ChunkCache {
    inner: Arc<Inner>,
}

impl ChunkCache {
    /// Build a cache with no interceptors
    pub fn new(config: ChunkCacheConfig, pool: Arc<dyn BufferPool>) -> Result<Self> {
        Self::builder(config, pool).build()
    }

    /// Start building a cache
    pub fn builder(config: ChunkCacheConfig, pool: Arc<dyn BufferPool>) -> ChunkCacheBuilder {
        ChunkCacheBuilder {
            config,
            pool,
            interceptors: Vec::new(),
        }
    }

    /// Rebufferer factory for `reader`.
    ///
    /// When caching is on this is a [`CachingRebufferer`] passed through the
    /// interceptors; otherwise the reader serves itself through an
    /// [`UnbufferedRebufferer`].
    pub fn maybe_wrap(&self, reader: Arc<dyn ChunkReader>) -> Result<Arc<dyn RebuffererFactory>> {
        let chunk_size = reader.chunk_size();
        if !chunk_size.is_power_of_two() {
            return Err(Error::InvalidChunkSize(chunk_size));
        }

        if !self.is_enabled() {
            return Ok(Arc::new(UnbufferedRebufferer::new(
                reader,
                Arc::clone(&self.inner.pool),
            )?));
        }

        let caching: Arc<dyn RebuffererFactory> = Arc::new(CachingRebufferer::new(
            reader,
            Arc::clone(&self.inner.store),
            self.inner.config.max_reference_attempts,
        )?);

        Ok(self
            .inner
            .interceptors
            .iter()
            .fold(caching, |factory, interceptor| interceptor.intercept(factory)))
    }

    /// Drop every cached chunk of `path`, returning how many were removed
    pub fn invalidate_file(&self, path: &str) -> usize {
        let removed = self.inner.store.invalidate_matching(|key| key.path() == path);
        debug!(path, removed, "invalidated file");
        removed
    }

    /// Drop every cached chunk
    pub fn close(&self) {
        let removed = self.inner.store.invalidate_all();
        debug!(removed, "chunk cache closed");
    }

    /// Turn caching on or off for files wrapped from now on.
    ///
    /// Drops all cached chunks and resets statistics either way.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
        self.inner.store.invalidate_all();
        self.inner.store.metrics().reset();
        info!(enabled, "chunk cache enable flag changed");
    }

    /// Whether newly wrapped files go through the cache
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire) && self.inner.store.capacity() > 0
    }

    /// Statistics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.store.stats()
    }

    /// Configuration the cache was built with
    pub fn config(&self) -> &ChunkCacheConfig {
        &self.inner.config
    }

    /// Pool chunk buffers come from
    pub fn pool(&self) -> &Arc<dyn BufferPool> {
        &self.inner.pool
    }
}

impl CacheSize for ChunkCache {
    fn capacity(&self) -> u64 {
        self.inner.store.capacity()
    }

    fn set_capacity(&self, _capacity: u64) -> Result<()> {
        Err(Error::CapacityImmutable)
    }

    fn size(&self) -> usize {
        self.inner.store.size()
    }

    fn weighted_size(&self) -> u64 {
        self.inner.store.weighted_size()
    }
}

impl fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCache")
            .field("enabled", &self.is_enabled())
            .field("capacity", &self.inner.store.capacity())
            .field("weighted_size", &self.inner.store.weighted_size())
            .field("interceptors", &self.inner.interceptors.len())
            .finish()
    }
}

/// Builder for [`ChunkCache`]
pub struct ChunkCacheBuilder {
    config: ChunkCacheConfig,
    pool: Arc<dyn BufferPool>,
    interceptors: Vec<Box<dyn RebuffererInterceptor>>,
}

impl ChunkCacheBuilder {
    /// Add an interceptor, applied after those added before it
    pub fn intercept<I>(mut self, interceptor: I) -> Self
    where
        I: RebuffererInterceptor + 'static,
    {
        self.interceptors.push(Box::new(interceptor));
        self
    }

    /// Validate the configuration and create the cache
    pub fn build(self) -> Result<ChunkCache> {
        self.config.validate()?;

        let capacity = self.config.capacity();
        let store = CacheStore::new(
            StoreConfig {
                capacity,
                shard_count: self.config.shard_count,
                round_up: self.config.round_up,
                eviction: self.config.eviction.clone(),
            },
            Arc::clone(&self.pool),
        );

        info!(
            capacity,
            enabled = self.config.is_enabled(),
            shards = self.config.shard_count,
            eviction = %self.config.eviction.name,
            "chunk cache initialized"
        );

        Ok(ChunkCache {
            inner: Arc::new(Inner {
                enabled: AtomicBool::new(self.config.enabled),
                config: self.config,
                store: Arc::new(store),
                pool: self.pool,
                interceptors: self.interceptors,
            }),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Channel, MemoryChannel, SimpleChunkReader, TrackingBufferPool};

    fn reader(path: &str) -> Arc<dyn ChunkReader> {
        let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new(path, vec![5u8; 8192]));
        Arc::new(SimpleChunkReader::new(channel, 4096).unwrap())
    }

    fn cache(capacity: u64) -> ChunkCache {
        let pool: Arc<dyn BufferPool> = Arc::new(TrackingBufferPool::default());
        ChunkCache::new(ChunkCacheConfig::with_capacity_bytes(capacity), pool).unwrap()
    }

    #[test]
    fn test_capacity_from_config() {
        let cache = cache(1 << 20);
        assert_eq!(cache.capacity(), 1 << 20);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.weighted_size(), 0);
        assert!(cache.is_enabled());
    }

    #[test]
    fn test_set_capacity_is_rejected() {
        let cache = cache(1 << 20);
        assert!(matches!(
            cache.set_capacity(1 << 30),
            Err(Error::CapacityImmutable)
        ));
        assert_eq!(cache.capacity(), 1 << 20);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let pool: Arc<dyn BufferPool> = Arc::new(TrackingBufferPool::default());
        let mut config = ChunkCacheConfig::default();
        config.shard_count = 3;
        assert!(ChunkCache::new(config, pool).is_err());
    }

    #[test]
    fn test_wrapped_reads_are_cached() {
        let cache = cache(1 << 20);
        let factory = cache.maybe_wrap(reader("/data/c-Data.db")).unwrap();
        let rebufferer = factory.instantiate_rebufferer();

        rebufferer.rebuffer(0).unwrap().release();
        rebufferer.rebuffer(100).unwrap().release();
        assert_eq!(cache.size(), 1);

        let stats = cache.metrics();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_set_enabled_resets() {
        let cache = cache(1 << 20);
        let factory = cache.maybe_wrap(reader("/data/c-Data.db")).unwrap();
        factory.instantiate_rebufferer().rebuffer(0).unwrap().release();
        assert_eq!(cache.size(), 1);

        cache.set_enabled(false);
        assert!(!cache.is_enabled());
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.metrics().misses, 0);

        cache.set_enabled(true);
        assert!(cache.is_enabled());
    }

    #[test]
    fn test_accessors() {
        let pool: Arc<dyn BufferPool> = Arc::new(TrackingBufferPool::default());
        let config = ChunkCacheConfig::with_capacity_bytes(8192);
        let cache = ChunkCache::new(config.clone(), Arc::clone(&pool)).unwrap();

        assert_eq!(cache.config(), &config);
        assert!(Arc::ptr_eq(cache.pool(), &pool));

        let clone = cache.clone();
        clone
            .maybe_wrap(reader("/data/c-Data.db"))
            .unwrap()
            .instantiate_rebufferer()
            .rebuffer(0)
            .unwrap()
            .release();
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_debug_format() {
        let cache = cache(4096);
        let debug = format!("{:?}", cache);
        assert!(debug.contains("ChunkCache"));
        assert!(debug.contains("capacity: 4096"));
    }
}
