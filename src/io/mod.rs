//! File access underneath the chunk cache
//!
//! - [`Channel`]: positional reads over a file
//! - [`ChunkReader`]: physical read of one aligned chunk
//! - [`BufferPool`]: where chunk memory comes from and goes back to
//! - [`Rebufferer`]: what readers call to get the chunk covering a position

pub mod channel;
pub mod pool;
pub mod reader;
pub mod rebufferer;

pub use channel::{Channel, FileChannel, MemoryChannel};
pub use pool::{BufferKind, BufferPool, HeapBufferPool, PoolStats, TrackingBufferPool, PAGE_SIZE};
pub use reader::{ChunkReader, ReaderFileProxy, SimpleChunkReader};
pub use rebufferer::{Rebufferer, RebuffererFactory, UnbufferedRebufferer};
