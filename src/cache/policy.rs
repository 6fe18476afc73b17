//! Cache Eviction Policy
//!
//! Controls how far the store shrinks once an insertion pushes it over
//! capacity, and how many victims it considers per pass.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Eviction policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionPolicy {
    /// Name of the policy
    pub name: String,
    /// Fraction of capacity to shrink to once eviction starts (0.0 - 1.0]
    pub low_watermark: f64,
    /// Maximum entries removed per eviction pass
    pub batch_size: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::lru()
    }
}

impl EvictionPolicy {
    /// Approximate LRU (default)
    ///
    /// Evicts least recently accessed chunks first, leaving a little headroom
    /// so that the next few inserts do not each trigger a pass.
    pub fn lru() -> Self {
        Self {
            name: "LRU".to_string(),
            low_watermark: 0.95,
            batch_size: 256,
        }
    }

    /// Strict LRU
    ///
    /// Evicts only down to capacity.
    pub fn strict() -> Self {
        Self {
            name: "LRU-strict".to_string(),
            low_watermark: 1.0,
            batch_size: 256,
        }
    }

    /// Weight the store evicts down to for the given capacity
    pub fn target_weight(&self, capacity: u64) -> u64 {
        (capacity as f64 * self.low_watermark) as u64
    }

    /// Check the policy parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.low_watermark > 0.0 && self.low_watermark <= 1.0) {
            return Err(Error::Config(format!(
                "eviction low watermark must be in (0, 1], got {}",
                self.low_watermark
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("eviction batch size must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
