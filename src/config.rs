//! Chunk cache configuration
//!
//! Read once when the cache is built. The only runtime override is
//! [`ChunkCache::set_enabled`](crate::cache::ChunkCache::set_enabled).

use serde::{Deserialize, Serialize};

use crate::cache::{
    EvictionPolicy, DEFAULT_MAX_REFERENCE_ATTEMPTS, DEFAULT_SHARD_COUNT, RESERVED_POOL_SPACE_MB,
};
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Chunk cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkCacheConfig {
    /// Total file cache budget in MiB, buffer pool reserve included
    pub file_cache_size_mb: u64,
    /// MiB held back for the buffer pool
    pub reserved_pool_space_mb: u64,
    /// Exact byte budget, overriding the MiB-derived one
    pub capacity_bytes: Option<u64>,
    /// Administrative enable flag
    pub enabled: bool,
    /// Allocate chunk buffers rounded up to the next power of two
    pub round_up: bool,
    /// Attempts to reference a chunk before giving up
    pub max_reference_attempts: u32,
    /// Store shard count (power of two)
    pub shard_count: usize,
    /// Eviction policy
    pub eviction: EvictionPolicy,
}

impl Default for ChunkCacheConfig {
    fn default() -> Self {
        Self {
            file_cache_size_mb: 512,
            reserved_pool_space_mb: RESERVED_POOL_SPACE_MB,
            capacity_bytes: None,
            enabled: true,
            round_up: false,
            max_reference_attempts: DEFAULT_MAX_REFERENCE_ATTEMPTS,
            shard_count: DEFAULT_SHARD_COUNT,
            eviction: EvictionPolicy::default(),
        }
    }
}

impl ChunkCacheConfig {
    /// Configuration with an exact byte capacity
    pub fn with_capacity_bytes(capacity: u64) -> Self {
        Self {
            capacity_bytes: Some(capacity),
            ..Self::default()
        }
    }

    /// Cache capacity in bytes, saturating at `u64::MAX`
    pub fn capacity(&self) -> u64 {
        self.checked_capacity().unwrap_or(u64::MAX)
    }

    /// Cache capacity in bytes, or `None` if the MiB budget overflows
    fn checked_capacity(&self) -> Option<u64> {
        match self.capacity_bytes {
            Some(bytes) => Some(bytes),
            None => self
                .file_cache_size_mb
                .saturating_sub(self.reserved_pool_space_mb)
                .checked_mul(MIB),
        }
    }

    /// Whether caching is on: enabled and left with a positive capacity
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.capacity() > 0
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.shard_count.is_power_of_two() {
            return Err(Error::Config(format!(
                "shard_count must be a power of two, got {}",
                self.shard_count
            )));
        }
        if self.max_reference_attempts == 0 {
            return Err(Error::Config(
                "max_reference_attempts must be at least 1".into(),
            ));
        }
        if self.checked_capacity().is_none() {
            return Err(Error::Config(format!(
                "file_cache_size_mb {} does not fit in a byte count",
                self.file_cache_size_mb
            )));
        }
        self.eviction.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
