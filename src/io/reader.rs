//! Chunked readers
//!
//! A [`ChunkReader`] performs the physical read of exactly one chunk. It is
//! what the cache calls on a miss; it never caches anything itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use super::channel::Channel;
use super::pool::BufferKind;
use crate::error::{Error, Result};

/// File-level accessors shared by readers and rebufferers
pub trait ReaderFileProxy: Send + Sync + fmt::Debug {
    /// Channel the data is read from
    fn channel(&self) -> &Arc<dyn Channel>;

    /// Logical length of the file in bytes
    fn file_length(&self) -> u64;

    /// Probability with which chunk checksums are verified
    fn crc_check_chance(&self) -> f64 {
        1.0
    }

    /// Release the file resources
    fn close(&self) -> Result<()>;
}

/// Reads fixed-size, aligned chunks of a data file
pub trait ChunkReader: ReaderFileProxy {
    /// Size of every chunk but possibly the last; must be a power of two
    fn chunk_size(&self) -> usize;

    /// Memory kind the reader works best with
    fn preferred_buffer_kind(&self) -> BufferKind {
        BufferKind::Standard
    }

    /// Read the chunk starting at `position` into `buffer`.
    ///
    /// `position` is a multiple of [`chunk_size`](Self::chunk_size). On
    /// success `buffer` holds exactly the chunk's bytes. Invalid on-disk data
    /// is reported as [`Error::Corruption`].
    fn read_chunk(&self, position: u64, buffer: &mut BytesMut) -> Result<()>;

    /// Implementation kind; part of a chunk's cache identity
    fn kind(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Path of the file being read
    fn file_path(&self) -> &str {
        self.channel().path()
    }
}

/// Reader for uncompressed files: chunk `n` is bytes `[n * size, (n + 1) * size)`
pub struct SimpleChunkReader {
    channel: Arc<dyn Channel>,
    chunk_size: usize,
    file_length: u64,
    buffer_kind: BufferKind,
    closed: AtomicBool,
}

impl SimpleChunkReader {
    /// Create a reader over `channel`, taking the file length from the channel
    pub fn new(channel: Arc<dyn Channel>, chunk_size: usize) -> Result<Self> {
        let file_length = channel.size()?;
        Self::with_length(channel, chunk_size, file_length)
    }

    /// Create a reader with an explicit logical file length
    pub fn with_length(channel: Arc<dyn Channel>, chunk_size: usize, file_length: u64) -> Result<Self> {
        if !chunk_size.is_power_of_two() {
            return Err(Error::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            channel,
            chunk_size,
            file_length,
            buffer_kind: BufferKind::Standard,
            closed: AtomicBool::new(false),
        })
    }

    /// Prefer page-rounded buffers
    pub fn with_buffer_kind(mut self, kind: BufferKind) -> Self {
        self.buffer_kind = kind;
        self
    }

    /// Whether [`close`](ReaderFileProxy::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SimpleChunkReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleChunkReader")
            .field("path", &self.channel.path())
            .field("chunk_size", &self.chunk_size)
            .field("file_length", &self.file_length)
            .finish()
    }
}

impl ReaderFileProxy for SimpleChunkReader {
    fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    fn file_length(&self) -> u64 {
        self.file_length
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl ChunkReader for SimpleChunkReader {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn preferred_buffer_kind(&self) -> BufferKind {
        self.buffer_kind
    }

    fn read_chunk(&self, position: u64, buffer: &mut BytesMut) -> Result<()> {
        debug_assert_eq!(position % self.chunk_size as u64, 0, "unaligned chunk read");

        if self.is_closed() {
            return Err(Error::ReaderClosed(self.channel.path().to_string()));
        }
        if position >= self.file_length {
            return Err(Error::PositionOutOfBounds {
                path: self.channel.path().to_string(),
                position,
                length: self.file_length,
            });
        }

        let len = (self.file_length - position).min(self.chunk_size as u64) as usize;
        buffer.clear();
        buffer.resize(len, 0);

        let mut filled = 0;
        while filled < len {
            let n = self
                .channel
                .read_at(&mut buffer[filled..], position + filled as u64)?;
            if n == 0 {
                buffer.clear();
                return Err(Error::corruption(
                    self.channel.path(),
                    position,
                    format!(
                        "unexpected end of file after {} of {} bytes",
                        filled, len
                    ),
                ));
            }
            filled += n;
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::channel::MemoryChannel;

    fn reader(len: usize, chunk_size: usize) -> SimpleChunkReader {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        SimpleChunkReader::new(Arc::new(MemoryChannel::new("mem/data", data)), chunk_size).unwrap()
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new("mem/x", vec![0u8; 10]));
        let err = SimpleChunkReader::new(channel, 1000).unwrap_err();
        assert!(matches!(err, Error::InvalidChunkSize(1000)));
    }

    #[test]
    fn test_read_full_and_final_chunk() {
        let reader = reader(10_000, 4096);
        let mut buf = BytesMut::with_capacity(4096);

        reader.read_chunk(4096, &mut buf).unwrap();
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf[0], (4096 % 251) as u8);

        reader.read_chunk(8192, &mut buf).unwrap();
        assert_eq!(buf.len(), 10_000 - 8192);
    }

    #[test]
    fn test_read_past_end() {
        let reader = reader(100, 64);
        let mut buf = BytesMut::new();
        let err = reader.read_chunk(128, &mut buf).unwrap_err();
        assert!(matches!(err, Error::PositionOutOfBounds { position: 128, .. }));
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new("mem/short", vec![1u8; 100]));
        let reader = SimpleChunkReader::with_length(channel, 64, 200).unwrap();
        let mut buf = BytesMut::new();
        let err = reader.read_chunk(64, &mut buf).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_closed_reader() {
        let reader = reader(100, 64);
        reader.close().unwrap();
        let mut buf = BytesMut::new();
        assert!(matches!(
            reader.read_chunk(0, &mut buf),
            Err(Error::ReaderClosed(_))
        ));
    }

    #[test]
    fn test_kind_and_path() {
        let reader = reader(100, 64);
        assert!(reader.kind().ends_with("SimpleChunkReader"));
        assert_eq!(reader.file_path(), "mem/data");
        assert_eq!(reader.crc_check_chance(), 1.0);
    }
}
