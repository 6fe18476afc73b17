//! Rebufferers: position to buffer translation
//!
//! A reader positioned anywhere in a file asks its [`Rebufferer`] for the
//! chunk covering that position and gets back a [`BufferHandle`] it holds
//! while consuming bytes.

use std::fmt;
use std::sync::Arc;

use super::channel::Channel;
use super::pool::BufferPool;
use super::reader::{ChunkReader, ReaderFileProxy};
use crate::cache::{BufferHandle, ChunkBuffer};
use crate::error::{Error, Result};

/// Serves chunk buffers for arbitrary file positions
pub trait Rebufferer: ReaderFileProxy {
    /// Buffer holding the chunk that contains `position`.
    ///
    /// The returned handle's [`aligned_offset`](BufferHandle::aligned_offset)
    /// is the chunk start, at or before `position`.
    fn rebuffer(&self, position: u64) -> Result<BufferHandle>;

    /// Called when a reader is done with this rebufferer
    fn close_reader(&self) {}
}

/// Hands out rebufferers for one file
pub trait RebuffererFactory: ReaderFileProxy {
    /// Rebufferer for one reader of the file
    fn instantiate_rebufferer(self: Arc<Self>) -> Arc<dyn Rebufferer>;

    /// Drop any cached copy of the chunk containing `position`
    fn invalidate_if_cached(&self, position: u64);
}

/// Rebufferer without caching: every call is a physical read into a fresh
/// pool buffer, returned to the pool when the handle is released
pub struct UnbufferedRebufferer {
    source: Arc<dyn ChunkReader>,
    pool: Arc<dyn BufferPool>,
    alignment_mask: u64,
}

impl UnbufferedRebufferer {
    /// Serve chunks of `source` from `pool`; its chunk size must be a power of two
    pub fn new(source: Arc<dyn ChunkReader>, pool: Arc<dyn BufferPool>) -> Result<Self> {
        let chunk_size = source.chunk_size();
        if !chunk_size.is_power_of_two() {
            return Err(Error::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            source,
            pool,
            alignment_mask: !(chunk_size as u64 - 1),
        })
    }
}

impl fmt::Debug for UnbufferedRebufferer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnbufferedRebufferer")
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for UnbufferedRebufferer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnbufferedRebufferer:{}", self.source.file_path())
    }
}

impl ReaderFileProxy for UnbufferedRebufferer {
    fn channel(&self) -> &Arc<dyn Channel> {
        self.source.channel()
    }

    fn file_length(&self) -> u64 {
        self.source.file_length()
    }

    fn crc_check_chance(&self) -> f64 {
        self.source.crc_check_chance()
    }

    fn close(&self) -> Result<()> {
        self.source.close()
    }
}

impl Rebufferer for UnbufferedRebufferer {
    fn rebuffer(&self, position: u64) -> Result<BufferHandle> {
        let aligned = position & self.alignment_mask;
        let buffer = ChunkBuffer::load(self.source.as_ref(), aligned, &self.pool, false)?;
        Ok(BufferHandle::adopt(buffer))
    }
}

impl RebuffererFactory for UnbufferedRebufferer {
    fn instantiate_rebufferer(self: Arc<Self>) -> Arc<dyn Rebufferer> {
        self
    }

    fn invalidate_if_cached(&self, _position: u64) {}
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryChannel, SimpleChunkReader, TrackingBufferPool};

    fn rebufferer(pool: &Arc<TrackingBufferPool>) -> Arc<UnbufferedRebufferer> {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new("/data/u-Data.db", data));
        let reader: Arc<dyn ChunkReader> = Arc::new(SimpleChunkReader::new(channel, 256).unwrap());
        let dyn_pool: Arc<dyn BufferPool> = pool.clone();
        Arc::new(UnbufferedRebufferer::new(reader, dyn_pool).unwrap())
    }

    #[derive(Debug)]
    struct ZeroChunks(SimpleChunkReader);

    impl ReaderFileProxy for ZeroChunks {
        fn channel(&self) -> &Arc<dyn Channel> {
            self.0.channel()
        }
        fn file_length(&self) -> u64 {
            self.0.file_length()
        }
        fn close(&self) -> Result<()> {
            self.0.close()
        }
    }

    impl ChunkReader for ZeroChunks {
        fn chunk_size(&self) -> usize {
            0
        }
        fn read_chunk(&self, position: u64, buffer: &mut bytes::BytesMut) -> Result<()> {
            self.0.read_chunk(position, buffer)
        }
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new("/data/z-Data.db", vec![0u8; 64]));
        let reader: Arc<dyn ChunkReader> =
            Arc::new(ZeroChunks(SimpleChunkReader::new(channel, 64).unwrap()));
        let pool: Arc<dyn BufferPool> = Arc::new(TrackingBufferPool::default());
        assert!(matches!(
            UnbufferedRebufferer::new(reader, pool),
            Err(Error::InvalidChunkSize(0))
        ));
    }

    #[test]
    fn test_rebuffer_aligns_and_reads() {
        let pool = Arc::new(TrackingBufferPool::default());
        let rebufferer = rebufferer(&pool);

        let handle = rebufferer.rebuffer(300).unwrap();
        assert_eq!(handle.aligned_offset(), 256);
        assert_eq!(handle.len(), 256);
        assert_eq!(handle.bytes()[300 - 256], (300 % 256) as u8);

        let last = rebufferer.rebuffer(999).unwrap();
        assert_eq!(last.aligned_offset(), 768);
        assert_eq!(last.len(), 1000 - 768);
    }

    #[test]
    fn test_every_call_is_a_fresh_buffer() {
        let pool = Arc::new(TrackingBufferPool::default());
        let rebufferer = rebufferer(&pool);

        let a = rebufferer.rebuffer(0).unwrap();
        let b = rebufferer.rebuffer(0).unwrap();
        assert!(!Arc::ptr_eq(a.buffer(), b.buffer()));
        assert_eq!(pool.outstanding(), 2);

        a.release();
        b.release();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_factory_returns_itself() {
        let pool = Arc::new(TrackingBufferPool::default());
        let factory = rebufferer(&pool);
        factory.invalidate_if_cached(0);
        let instance = Arc::clone(&factory).instantiate_rebufferer();
        assert_eq!(instance.file_length(), 1000);
        assert_eq!(factory.to_string(), "UnbufferedRebufferer:/data/u-Data.db");
    }
}
