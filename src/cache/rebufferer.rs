//! Caching rebufferer
//!
//! Per-file front of the chunk cache. Aligns a requested position down to its
//! chunk, fetches the chunk from the shared [`CacheStore`] and takes a
//! reference on it. The reference can lose a race with eviction, in which
//! case the lookup is repeated a bounded number of times.

use std::fmt;
use std::sync::Arc;

use crossbeam::utils::Backoff;
use tracing::warn;

use super::buffer::BufferHandle;
use super::key::ChunkKey;
use super::store::CacheStore;
use crate::error::{Error, Result};
use crate::io::{Channel, ChunkReader, ReaderFileProxy, Rebufferer, RebuffererFactory};

/// Rebufferer serving one file's chunks from the shared store
///
/// One instance is shared by every reader of the file.
pub struct CachingRebufferer {
    source: Arc<dyn ChunkReader>,
    store: Arc<CacheStore>,
    /// `!(chunk_size - 1)`
    alignment_mask: u64,
    max_attempts: u32,
    /// Key of chunk 0, reused to build keys without recomputing file identity
    base_key: ChunkKey,
}

impl CachingRebufferer {
    /// Wrap `source`; its chunk size must be a power of two
    pub fn new(source: Arc<dyn ChunkReader>, store: Arc<CacheStore>, max_attempts: u32) -> Result<Self> {
        let chunk_size = source.chunk_size();
        if !chunk_size.is_power_of_two() {
            return Err(Error::InvalidChunkSize(chunk_size));
        }
        let base_key = ChunkKey::new(Arc::clone(&source), 0);
        Ok(Self {
            source,
            store,
            alignment_mask: !(chunk_size as u64 - 1),
            max_attempts: max_attempts.max(1),
            base_key,
        })
    }

    /// Chunk-aligned position covering `position`
    #[inline]
    pub fn aligned(&self, position: u64) -> u64 {
        position & self.alignment_mask
    }

    fn key(&self, position: u64) -> ChunkKey {
        self.base_key.at(self.aligned(position))
    }
}

impl fmt::Debug for CachingRebufferer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingRebufferer")
            .field("source", &self.source)
            .field("alignment_mask", &format_args!("{:#x}", self.alignment_mask))
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl fmt::Display for CachingRebufferer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CachingRebufferer:{}", self.source.file_path())
    }
}

impl ReaderFileProxy for CachingRebufferer {
    fn channel(&self) -> &Arc<dyn Channel> {
        self.source.channel()
    }

    fn file_length(&self) -> u64 {
        self.source.file_length()
    }

    fn crc_check_chance(&self) -> f64 {
        self.source.crc_check_chance()
    }

    /// Closes the reader; cached chunks stay until evicted or invalidated
    fn close(&self) -> Result<()> {
        self.source.close()
    }
}

impl Rebufferer for CachingRebufferer {
    fn rebuffer(&self, position: u64) -> Result<BufferHandle> {
        let key = self.key(position);
        let backoff = Backoff::new();

        for _ in 0..self.max_attempts {
            let buffer = self.store.get_or_load(&key)?;
            if let Some(handle) = buffer.reference() {
                return Ok(handle);
            }
            // Evicted and released between lookup and reference
            backoff.snooze();
        }

        warn!(
            key = %key,
            attempts = self.max_attempts,
            "could not reference chunk; cache too small for the request concurrency"
        );
        Err(Error::CacheExhausted {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Shared instance: nothing to do per reader
    fn close_reader(&self) {}
}

impl RebuffererFactory for CachingRebufferer {
    fn instantiate_rebufferer(self: Arc<Self>) -> Arc<dyn Rebufferer> {
        self
    }

    fn invalidate_if_cached(&self, position: u64) {
        self.store.invalidate(&self.key(position));
    }
}

// =============================================================================
// Tests
// =============================================================================
