//! Reference-counted chunk buffers
//!
//! A [`ChunkBuffer`] owns one chunk's bytes, borrowed from a [`BufferPool`].
//! It starts with a single reference, held by whoever created it (normally
//! the cache store on behalf of the slot). Readers obtain further references
//! as [`BufferHandle`]s. When the count drops from 1 to 0 the memory goes
//! back to the pool, exactly once, and the buffer can never be referenced
//! again.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::Result;
use crate::io::{BufferPool, ChunkReader, ReaderFileProxy};

/// One loaded chunk plus its reference count
pub struct ChunkBuffer {
    /// Chunk bytes; taken out only by the 1 -> 0 transition
    data: UnsafeCell<Option<BytesMut>>,
    /// Allocated capacity, the entry's weight in the store
    capacity: usize,
    /// Chunk-aligned file offset of the first byte
    offset: u64,
    references: AtomicU32,
    pool: Arc<dyn BufferPool>,
}

// SAFETY: `data` is only read through a live reference (count > 0) and only
// taken by the single thread that moves the count from 1 to 0, after which no
// reference can be obtained. The AcqRel decrement orders every reader's
// accesses before the take.
unsafe impl Send for ChunkBuffer {}
unsafe impl Sync for ChunkBuffer {}

impl ChunkBuffer {
    /// Wrap loaded bytes; the caller holds the initial reference
    pub(crate) fn new(data: BytesMut, offset: u64, pool: Arc<dyn BufferPool>) -> Self {
        Self {
            capacity: data.capacity(),
            data: UnsafeCell::new(Some(data)),
            offset,
            references: AtomicU32::new(1),
            pool,
        }
    }

    /// Load the chunk at `position` from `reader` into a buffer taken from `pool`.
    ///
    /// With `round_up` the buffer capacity is the next power of two of the
    /// chunk's length, so an undersized final chunk reuses full-size buffers.
    pub(crate) fn load(
        reader: &dyn ChunkReader,
        position: u64,
        pool: &Arc<dyn BufferPool>,
        round_up: bool,
    ) -> Result<Self> {
        let remaining = reader.file_length().saturating_sub(position);
        let len = remaining.min(reader.chunk_size() as u64).max(1) as usize;
        let size = if round_up { len.next_power_of_two() } else { len };

        let mut data = Borrowed {
            data: pool.acquire(size, reader.preferred_buffer_kind())?,
            pool,
        };
        reader.read_chunk(position, &mut data.data)?;

        Ok(Self::new(data.take(), position, Arc::clone(pool)))
    }

    /// Allocated capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunk-aligned file offset
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Current reference count
    pub fn references(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    /// Try to take a reference.
    ///
    /// Fails once the count has reached zero: a released buffer is never
    /// resurrected. Never blocks.
    pub fn reference(self: &Arc<Self>) -> Option<BufferHandle> {
        let mut current = self.references.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.references.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BufferHandle {
                        buffer: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one reference, returning the memory to the pool on the last one
    pub(crate) fn release(&self) {
        let mut current = self.references.load(Ordering::Acquire);
        loop {
            if current == 0 {
                tracing::error!(
                    offset = self.offset,
                    "chunk buffer released more times than it was referenced"
                );
                debug_assert!(false, "chunk buffer over-released");
                return;
            }
            match self.references.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 {
            // SAFETY: we performed the only 1 -> 0 transition; no reference
            // exists and none can be taken any more.
            if let Some(data) = unsafe { (*self.data.get()).take() } {
                self.pool.release(data);
            }
        }
    }

    /// Bytes of the chunk; the caller must hold a reference
    fn view(&self) -> &[u8] {
        assert!(
            self.references() > 0,
            "chunk buffer read without holding a reference"
        );
        // SAFETY: a live reference keeps `data` in place (see the Sync impl).
        unsafe { (*self.data.get()).as_deref().unwrap_or(&[]) }
    }
}

impl fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .field("references", &self.references())
            .finish()
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.get_mut().take() {
            tracing::warn!(
                offset = self.offset,
                references = self.references(),
                "chunk buffer dropped with live references; returning memory to the pool"
            );
            self.pool.release(data);
        }
    }
}

/// Pool memory that goes back to its pool unless taken, on error and unwind alike
struct Borrowed<'a> {
    data: BytesMut,
    pool: &'a Arc<dyn BufferPool>,
}

impl Borrowed<'_> {
    fn take(mut self) -> BytesMut {
        std::mem::take(&mut self.data)
    }
}

impl Drop for Borrowed<'_> {
    fn drop(&mut self) {
        // Taken buffers leave an empty, unallocated `BytesMut` behind
        if self.data.capacity() > 0 {
            self.pool.release(std::mem::take(&mut self.data));
        }
    }
}

/// A live reference on a [`ChunkBuffer`].
///
/// Dropping the handle releases the reference. Cloning takes another one.
pub struct BufferHandle {
    buffer: Arc<ChunkBuffer>,
}

impl BufferHandle {
    /// Take over the initial reference of a freshly created buffer
    pub(crate) fn adopt(buffer: ChunkBuffer) -> Self {
        debug_assert_eq!(buffer.references(), 1);
        Self {
            buffer: Arc::new(buffer),
        }
    }

    /// The chunk's bytes
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.buffer.view()
    }

    /// File offset of the first byte of [`bytes`](Self::bytes)
    #[inline]
    pub fn aligned_offset(&self) -> u64 {
        self.buffer.offset()
    }

    /// Number of bytes in the chunk
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Whether the chunk is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release the reference now
    pub fn release(self) {
        drop(self)
    }

    /// The underlying buffer
    pub fn buffer(&self) -> &Arc<ChunkBuffer> {
        &self.buffer
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        // We hold a reference, so the count is positive and cannot reach zero
        // while we increment it.
        self.buffer.references.fetch_add(1, Ordering::AcqRel);
        Self {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.buffer.release();
    }
}

impl AsRef<[u8]> for BufferHandle {
    fn as_ref(&self) -> &[u8] {
        self.bytes()
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("offset", &self.aligned_offset())
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
