//! Buffer allocators backing chunk buffers
//!
//! The cache never frees chunk memory itself: it borrows a buffer from a
//! [`BufferPool`] when a chunk is loaded and hands it back when the last
//! reference to the chunk goes away.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Page size used for aligned buffers
pub const PAGE_SIZE: usize = 4096;

/// Kind of memory a reader prefers for its chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    /// Ordinary heap memory
    Standard,
    /// Capacity rounded to whole pages, for direct I/O style readers
    Aligned,
}

/// Thread-safe allocator of byte buffers
pub trait BufferPool: Send + Sync + fmt::Debug {
    /// Hand out an empty buffer with at least `size` bytes of capacity
    fn acquire(&self, size: usize, kind: BufferKind) -> Result<BytesMut>;

    /// Take a buffer back
    fn release(&self, buffer: BytesMut);
}

/// Heap allocator that keeps released buffers for reuse
///
/// Buffers are recycled per capacity; at most `max_retained_bytes` of idle
/// capacity is kept, anything beyond that is freed.
pub struct HeapBufferPool {
    free: DashMap<usize, Vec<BytesMut>>,
    retained_bytes: AtomicU64,
    max_retained_bytes: u64,
}

impl HeapBufferPool {
    /// Create a pool retaining up to `max_retained_bytes` of idle buffers
    pub fn new(max_retained_bytes: u64) -> Self {
        Self {
            free: DashMap::new(),
            retained_bytes: AtomicU64::new(0),
            max_retained_bytes,
        }
    }

    /// Bytes currently parked in the free lists
    pub fn retained_bytes(&self) -> u64 {
        self.retained_bytes.load(Ordering::Relaxed)
    }

    fn size_for(size: usize, kind: BufferKind) -> usize {
        match kind {
            BufferKind::Standard => size,
            BufferKind::Aligned => (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1),
        }
    }
}

impl Default for HeapBufferPool {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

impl fmt::Debug for HeapBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBufferPool")
            .field("retained_bytes", &self.retained_bytes())
            .field("max_retained_bytes", &self.max_retained_bytes)
            .finish()
    }
}

impl BufferPool for HeapBufferPool {
    fn acquire(&self, size: usize, kind: BufferKind) -> Result<BytesMut> {
        if size == 0 {
            return Err(Error::BufferAllocation {
                size,
                reason: "size must be greater than 0".into(),
            });
        }

        let capacity = Self::size_for(size, kind);
        if let Some(mut list) = self.free.get_mut(&capacity) {
            if let Some(buffer) = list.pop() {
                self.retained_bytes
                    .fetch_sub(capacity as u64, Ordering::Relaxed);
                return Ok(buffer);
            }
        }

        Ok(BytesMut::with_capacity(capacity))
    }

    fn release(&self, mut buffer: BytesMut) {
        let capacity = buffer.capacity();
        let retained = self.retained_bytes.load(Ordering::Relaxed);
        if retained + capacity as u64 > self.max_retained_bytes {
            return;
        }

        buffer.clear();
        self.retained_bytes
            .fetch_add(capacity as u64, Ordering::Relaxed);
        self.free
            .entry(capacity)
            .or_default()
            .push(buffer);
    }
}

/// Counters kept by [`TrackingBufferPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Successful acquires
    pub acquired: u64,
    /// Releases
    pub released: u64,
    /// Buffers handed out and not yet returned
    pub outstanding: u64,
}

/// Pool decorator counting acquires and releases, used to detect leaks and
/// double returns
pub struct TrackingBufferPool {
    inner: Arc<dyn BufferPool>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl TrackingBufferPool {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn BufferPool>) -> Self {
        Self {
            inner,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Number of successful acquires
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Number of releases
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Buffers currently out of the pool
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired(),
            released: self.released(),
            outstanding: self.outstanding(),
        }
    }
}

impl Default for TrackingBufferPool {
    fn default() -> Self {
        Self::new(Arc::new(HeapBufferPool::default()))
    }
}

impl fmt::Debug for TrackingBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingBufferPool")
            .field("acquired", &self.acquired())
            .field("released", &self.released())
            .finish()
    }
}

impl BufferPool for TrackingBufferPool {
    fn acquire(&self, size: usize, kind: BufferKind) -> Result<BytesMut> {
        let buffer = self.inner.acquire(size, kind)?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(buffer)
    }

    fn release(&self, buffer: BytesMut) {
        let released = self.released.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(
            released <= self.acquired(),
            "buffer returned to the pool more times than it was handed out"
        );
        self.inner.release(buffer);
    }
}

// =============================================================================
// Tests
// =============================================================================
