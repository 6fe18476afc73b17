//! Cache Metrics Collection
//!
//! Hit/miss, load and eviction counters for the chunk cache. Purely
//! informational: nothing in the cache's behaviour depends on them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Why an entry left the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalCause {
    /// Evicted to stay within capacity
    Size,
    /// Removed by an invalidation
    Explicit,
    /// A load finished after its slot was invalidated
    Replaced,
}

impl fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalCause::Size => write!(f, "size"),
            RemovalCause::Explicit => write!(f, "explicit"),
            RemovalCause::Replaced => write!(f, "replaced"),
        }
    }
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,

    // Physical loads
    load_success: AtomicU64,
    load_failure: AtomicU64,
    total_load_time_ns: AtomicU64,

    // Removals by cause
    evictions_size: AtomicU64,
    evictions_explicit: AtomicU64,
    evictions_replaced: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_success(&self, duration: Duration) {
        self.load_success.fetch_add(1, Ordering::Relaxed);
        self.total_load_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self, duration: Duration) {
        self.load_failure.fetch_add(1, Ordering::Relaxed);
        self.total_load_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_removal(&self, cause: RemovalCause) {
        let counter = match cause {
            RemovalCause::Size => &self.evictions_size,
            RemovalCause::Explicit => &self.evictions_explicit,
            RemovalCause::Replaced => &self.evictions_replaced,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn load_success(&self) -> u64 {
        self.load_success.load(Ordering::Relaxed)
    }

    pub fn load_failure(&self) -> u64 {
        self.load_failure.load(Ordering::Relaxed)
    }

    pub fn evictions(&self, cause: RemovalCause) -> u64 {
        match cause {
            RemovalCause::Size => self.evictions_size.load(Ordering::Relaxed),
            RemovalCause::Explicit => self.evictions_explicit.load(Ordering::Relaxed),
            RemovalCause::Replaced => self.evictions_replaced.load(Ordering::Relaxed),
        }
    }

    /// Fraction of requests served without a physical load
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Mean time spent in physical loads, successful or not
    pub fn average_load_latency(&self) -> Duration {
        let loads = self.load_success() + self.load_failure();
        if loads == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_load_time_ns.load(Ordering::Relaxed) / loads)
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self, entries: u64, weighted_size: u64, capacity: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            load_success: self.load_success(),
            load_failure: self.load_failure(),
            average_load_latency_us: self.average_load_latency().as_micros() as u64,
            evictions_size: self.evictions(RemovalCause::Size),
            evictions_explicit: self.evictions(RemovalCause::Explicit),
            evictions_replaced: self.evictions(RemovalCause::Replaced),
            entries,
            weighted_size,
            capacity,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.load_success.store(0, Ordering::Relaxed);
        self.load_failure.store(0, Ordering::Relaxed);
        self.total_load_time_ns.store(0, Ordering::Relaxed);
        self.evictions_size.store(0, Ordering::Relaxed);
        self.evictions_explicit.store(0, Ordering::Relaxed);
        self.evictions_replaced.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of the cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub load_success: u64,
    pub load_failure: u64,
    pub average_load_latency_us: u64,
    pub evictions_size: u64,
    pub evictions_explicit: u64,
    pub evictions_replaced: u64,

    // Store occupancy at snapshot time
    pub entries: u64,
    pub weighted_size: u64,
    pub capacity: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "entries:            {}", self.entries)?;
        writeln!(
            f,
            "weighted size:      {} / {} bytes",
            self.weighted_size, self.capacity
        )?;
        writeln!(
            f,
            "hits / misses:      {} / {} ({:.2}% hit ratio)",
            self.hits,
            self.misses,
            self.hit_ratio * 100.0
        )?;
        writeln!(
            f,
            "loads ok / failed:  {} / {} (avg {} us)",
            self.load_success, self.load_failure, self.average_load_latency_us
        )?;
        write!(
            f,
            "removals:           {} size, {} explicit, {} replaced",
            self.evictions_size, self.evictions_explicit, self.evictions_replaced
        )
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
