//! Chunk Cache - shared cache of aligned file chunks for a column store
//!
//! Readers of on-disk data files ask for the chunk covering a position and
//! get back a reference-counted buffer. Chunks are kept in a bounded,
//! weighted, sharded cache; memory goes back to the buffer pool only when
//! the last reference to a chunk is released.
//!
//! # Architecture
//!
//! ```text
//! reader ──▶ Rebufferer::rebuffer(position)
//!              │
//!              ├─ CachingRebufferer ──▶ CacheStore ──▶ ChunkReader::read_chunk (miss)
//!              │                           │
//!              └─ UnbufferedRebufferer     └─▶ ChunkBuffer ◀──▶ BufferPool
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Store, buffers, caching rebufferer and the [`ChunkCache`] façade
//! - [`config`] - Cache configuration
//! - [`error`] - Error types
//! - [`io`] - Channels, chunk readers, buffer pools and the rebufferer contracts
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chunk_cache::{ChunkCache, ChunkCacheConfig, Rebufferer};
//! use chunk_cache::io::{BufferPool, Channel, ChunkReader, FileChannel, HeapBufferPool, SimpleChunkReader};
//!
//! # fn main() -> chunk_cache::Result<()> {
//! let pool: Arc<dyn BufferPool> = Arc::new(HeapBufferPool::default());
//! let cache = ChunkCache::new(ChunkCacheConfig::default(), pool)?;
//!
//! let channel: Arc<dyn Channel> = Arc::new(FileChannel::open("/var/lib/data/nb-1-big-Data.db")?);
//! let reader: Arc<dyn ChunkReader> = Arc::new(SimpleChunkReader::new(channel, 65536)?);
//! let rebufferer = cache.maybe_wrap(reader)?.instantiate_rebufferer();
//!
//! let chunk = rebufferer.rebuffer(70_000)?;
//! assert_eq!(chunk.aligned_offset(), 65_536);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod io;

// Re-export commonly used types
pub use cache::{BufferHandle, CacheSize, ChunkCache, ChunkCacheBuilder, ChunkKey, MetricsSnapshot};
pub use config::ChunkCacheConfig;
pub use error::{Error, Result};
pub use io::{BufferPool, ChunkReader, Rebufferer, RebuffererFactory};
