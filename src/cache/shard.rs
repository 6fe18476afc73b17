//! Sharded Map Implementation
//!
//! Concurrent hashmap split into power-of-two shards, each behind its own
//! `RwLock`, so lookups of different keys rarely touch the same lock.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Cache-line padding between shards prevents false sharing

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crossbeam::utils::CachePadded;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Single shard: one lock-protected hashmap
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Lock the shard for reading
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.map.read()
    }

    /// Lock the shard for writing
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.map.write()
    }

    /// Number of entries in this shard
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Check if the shard is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sharded map with a runtime shard count
pub struct ShardedMap<K, V> {
    shards: Box<[CachePadded<Shard<K, V>>]>,
    mask: usize,
}

impl<K, V> ShardedMap<K, V> {
    /// Create a map with `shard_count` shards (rounded up to a power of two)
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        let shards: Vec<CachePadded<Shard<K, V>>> =
            (0..count).map(|_| CachePadded::new(Shard::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
            mask: count - 1,
        }
    }

    /// Get the shard count
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Iterate over all shards
    pub fn shards(&self) -> impl Iterator<Item = &Shard<K, V>> {
        self.shards.iter().map(|s| &**s)
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards().map(|s| s.len()).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.shards().all(|s| s.is_empty())
    }
}

impl<K: Hash, V> ShardedMap<K, V> {
    /// Compute shard index from hash
    #[inline]
    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    /// Shard owning `key`
    #[inline]
    pub fn shard(&self, key: &K) -> &Shard<K, V> {
        &self.shards[self.shard_index(key)]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_rounds_to_power_of_two() {
        let map: ShardedMap<u64, u64> = ShardedMap::new(10);
        assert_eq!(map.shard_count(), 16);
        assert!(map.is_empty());

        let single: ShardedMap<u64, u64> = ShardedMap::new(0);
        assert_eq!(single.shard_count(), 1);
    }

    #[test]
    fn test_same_key_same_shard() {
        let map: ShardedMap<String, i32> = ShardedMap::new(16);
        let a = map.shard(&"key1".to_string()) as *const _;
        let b = map.shard(&"key1".to_string()) as *const _;
        assert_eq!(a, b);
    }

    #[test]
    fn test_insert_through_shard() {
        let map: ShardedMap<String, i32> = ShardedMap::new(16);

        for i in 0..100 {
            let key = format!("key{}", i);
            map.shard(&key).write().insert(key.clone(), i);
        }

        assert_eq!(map.len(), 100);
        assert_eq!(map.shard(&"key7".to_string()).read().get("key7"), Some(&7));
    }

    #[test]
    fn test_readers_share_a_shard() {
        let map: ShardedMap<u64, u64> = ShardedMap::new(1);
        map.shard(&1).write().insert(1, 10);

        let first = map.shard(&1).read();
        let second = map.shard(&1).read();
        assert_eq!(first.get(&1), Some(&10));
        assert_eq!(second.get(&1), Some(&10));
        assert!(map.shard(&1).map.try_write().is_none());
        drop((first, second));
        assert!(map.shard(&1).map.try_write().is_some());
    }

    #[test]
    fn test_distribution() {
        let map: ShardedMap<String, i32> = ShardedMap::new(16);

        for i in 0..1000 {
            let key = format!("key{}", i);
            map.shard(&key).write().insert(key.clone(), i);
        }

        let counts: Vec<usize> = map.shards().map(|s| s.len()).collect();
        let max_count = *counts.iter().max().unwrap();
        let min_count = *counts.iter().min().unwrap();
        assert!(max_count < 200, "Uneven distribution: max shard has {} entries", max_count);
        assert!(min_count > 20, "Uneven distribution: min shard has {} entries", min_count);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<String, i32>> = Arc::new(ShardedMap::new(16));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let key = format!("key-{}-{}", t, i);
                        map.shard(&key).write().insert(key.clone(), i);
                        assert!(map.shard(&key).read().contains_key(&key));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 8000);
    }
}
