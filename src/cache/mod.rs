//! Chunk Cache
//!
//! Weighted, bounded, concurrently accessed cache of fixed-size aligned
//! chunks read from data files.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ChunkCache                           │
//! │     config · buffer pool · interceptors · enable flag        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  CachingRebufferer (one per file)                            │
//! │    position ─▶ align ─▶ ChunkKey ─▶ get_or_load ─▶ reference │
//! ├──────────────────────────────────────────────────────────────┤
//! │  CacheStore                                                  │
//! │  ┌──────────────┐ ┌──────────────┐       ┌──────────────┐    │
//! │  │ shard RwLock │ │ shard RwLock │  ...  │ shard RwLock │    │
//! │  └──────────────┘ └──────────────┘       └──────────────┘    │
//! │    single-flight loads · LRU eviction · removal hook         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ChunkBuffer (refcounted) ──▶ BufferPool                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - A chunk's memory goes back to the pool only when its last reference is
//!   released, whoever holds it
//! - Hits never take a global lock
//! - Eviction only ever drops the store's own reference

mod buffer;
mod chunk_cache;
mod key;
mod metrics;
mod policy;
mod rebufferer;
mod shard;
mod store;

pub use buffer::{BufferHandle, ChunkBuffer};
pub use chunk_cache::{CacheSize, ChunkCache, ChunkCacheBuilder, RebuffererInterceptor};
pub use key::ChunkKey;
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot, RemovalCause};
pub use policy::EvictionPolicy;
pub use rebufferer::CachingRebufferer;
pub use shard::{Shard, ShardedMap};
pub use store::{CacheStore, StoreConfig};

/// Number of store shards
pub const DEFAULT_SHARD_COUNT: usize = 64;

/// Attempts to reference a chunk before a read fails
pub const DEFAULT_MAX_REFERENCE_ATTEMPTS: u32 = 1000;

/// Space held back from the file cache budget for the buffer pool (MiB)
pub const RESERVED_POOL_SPACE_MB: u64 = 32;

// =============================================================================
// Tests
// =============================================================================
