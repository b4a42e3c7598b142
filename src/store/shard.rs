//! Sharded Map Implementation
//!
//! Concurrent map split into power-of-two shards, each behind its own
//! `RwLock`. Every slot carries the byte weight it was inserted with so that
//! replacements and removals keep the shard's byte total exact.
//!
//! # Design
//!
//! - Shard chosen from the key's pre-computed hash (bitwise AND)
//! - Sampling walks shards from a caller-chosen start and tolerates
//!   concurrent mutation: it is best-effort, not a snapshot

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::element::CacheKey;

struct Slot<V> {
    value: V,
    weight: u64,
}

/// Single shard containing a hashmap and its counters
pub struct Shard<V> {
    map: RwLock<HashMap<CacheKey, Slot<V>>>,
    count: AtomicU64,
    size_bytes: AtomicU64,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Shard<V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            count: AtomicU64::new(0),
            size_bytes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    fn get(&self, key: &CacheKey) -> Option<V>
    where
        V: Clone,
    {
        self.map.read().get(key).map(|slot| slot.value.clone())
    }

    fn contains_key(&self, key: &CacheKey) -> bool {
        self.map.read().contains_key(key)
    }

    fn insert(&self, key: CacheKey, value: V, weight: u64) -> Option<V> {
        let mut guard = self.map.write();
        let old = guard.insert(key, Slot { value, weight });
        match &old {
            Some(slot) => {
                self.size_bytes.fetch_sub(slot.weight, Ordering::Relaxed);
            }
            None => {
                self.count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.size_bytes.fetch_add(weight, Ordering::Relaxed);
        old.map(|slot| slot.value)
    }

    fn remove(&self, key: &CacheKey) -> Option<V> {
        let mut guard = self.map.write();
        let removed = guard.remove(key)?;
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.size_bytes.fetch_sub(removed.weight, Ordering::Relaxed);
        Some(removed.value)
    }

    fn update<R>(&self, key: &CacheKey, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut guard = self.map.write();
        guard.get_mut(key).map(|slot| f(&mut slot.value))
    }

    fn clear(&self) -> usize {
        let mut guard = self.map.write();
        let n = guard.len();
        guard.clear();
        self.count.store(0, Ordering::Relaxed);
        self.size_bytes.store(0, Ordering::Relaxed);
        n
    }

    fn collect<C>(&self, out: &mut Vec<C>, limit: usize, f: &impl Fn(&CacheKey, &V) -> Option<C>) {
        let guard = self.map.read();
        for (key, slot) in guard.iter() {
            if out.len() >= limit {
                return;
            }
            if let Some(candidate) = f(key, &slot.value) {
                out.push(candidate);
            }
        }
    }
}

/// Sharded map keyed by [`CacheKey`]
pub struct ShardedMap<V, const N: usize = 64> {
    shards: Box<[Shard<V>]>,
}

impl<V, const N: usize> Default for ShardedMap<V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, const N: usize> ShardedMap<V, N> {
    /// Create a new sharded map
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "shard count must be a power of two");
        let shards: Vec<Shard<V>> = (0..N).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    #[inline]
    fn shard_for(&self, key: &CacheKey) -> &Shard<V> {
        &self.shards[key.shard_index(N)]
    }

    /// Entry count across all shards (approximate under concurrent writes)
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Total weight across all shards
    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.size_bytes()).sum()
    }

    pub fn get(&self, key: &CacheKey) -> Option<V>
    where
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.shard_for(key).contains_key(key)
    }

    /// Insert or replace, returning the previous value
    pub fn insert(&self, key: CacheKey, value: V, weight: u64) -> Option<V> {
        let idx = key.shard_index(N);
        self.shards[idx].insert(key, value, weight)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.shard_for(key).remove(key)
    }

    /// Mutate a value in place; weight is unchanged
    pub fn update<R>(&self, key: &CacheKey, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.shard_for(key).update(key, f)
    }

    /// Remove everything, returning how many entries were dropped
    pub fn clear(&self) -> usize {
        self.shards.iter().map(|s| s.clear()).sum()
    }

    /// All keys (weakly consistent)
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            shard.collect(&mut out, usize::MAX, &|k: &CacheKey, _: &V| Some(k.clone()));
        }
        out
    }

    /// All entries (weakly consistent)
    pub fn entries(&self) -> Vec<(CacheKey, V)>
    where
        V: Clone,
    {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            shard.collect(&mut out, usize::MAX, &|k: &CacheKey, v: &V| {
                Some((k.clone(), v.clone()))
            });
        }
        out
    }

    /// Collect up to `limit` candidates walking shards from `start_shard`
    pub fn sample<C>(
        &self,
        start_shard: usize,
        limit: usize,
        f: impl Fn(&CacheKey, &V) -> Option<C>,
    ) -> Vec<C> {
        let mut out = Vec::with_capacity(limit.min(self.len()));
        for offset in 0..N {
            if out.len() >= limit {
                break;
            }
            let shard = &self.shards[(start_shard + offset) & (N - 1)];
            shard.collect(&mut out, limit, &f);
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> CacheKey {
        CacheKey::new(format!("key{}", i))
    }

    #[test]
    fn test_sharded_map_insert_get() {
        let map: ShardedMap<i32, 16> = ShardedMap::new();

        map.insert(key(1), 42, 4);
        map.insert(key(2), 100, 4);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&key(1)), Some(42));
        assert_eq!(map.get(&key(3)), None);
    }

    #[test]
    fn test_replace_adjusts_weight() {
        let map: ShardedMap<&'static str, 16> = ShardedMap::new();

        assert!(map.insert(key(1), "small", 10).is_none());
        assert_eq!(map.insert(key(1), "large", 100), Some("small"));

        assert_eq!(map.len(), 1);
        assert_eq!(map.size_bytes(), 100);

        map.remove(&key(1));
        assert_eq!(map.size_bytes(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_update_in_place() {
        let map: ShardedMap<i32, 16> = ShardedMap::new();
        map.insert(key(1), 42, 4);

        assert_eq!(map.update(&key(1), |v| {
            *v += 10;
            *v
        }), Some(52));
        assert_eq!(map.update(&key(9), |v| *v), None);
    }

    #[test]
    fn test_sample_respects_limit_and_filter() {
        let map: ShardedMap<usize, 16> = ShardedMap::new();
        for i in 0..200 {
            map.insert(key(i), i, 1);
        }

        let sampled = map.sample(5, 15, |_, v| Some(*v));
        assert_eq!(sampled.len(), 15);

        let evens = map.sample(0, usize::MAX, |_, v| (v % 2 == 0).then_some(*v));
        assert_eq!(evens.len(), 100);
    }

    #[test]
    fn test_sample_covers_small_population() {
        let map: ShardedMap<usize, 64> = ShardedMap::new();
        for i in 0..5 {
            map.insert(key(i), i, 1);
        }
        for start in [0, 17, 63] {
            assert_eq!(map.sample(start, 15, |k, _| Some(k.clone())).len(), 5);
        }
    }

    #[test]
    fn test_clear_returns_count() {
        let map: ShardedMap<i32, 16> = ShardedMap::new();
        for i in 0..100 {
            map.insert(key(i), i as i32, 4);
        }
        assert_eq!(map.clear(), 100);
        assert!(map.is_empty());
        assert_eq!(map.size_bytes(), 0);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<i32, 16>> = Arc::new(ShardedMap::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let k = CacheKey::new(format!("key-{}-{}", t, i));
                        map.insert(k.clone(), i as i32, 4);
                        map.get(&k);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 8000);
        assert_eq!(map.size_bytes(), 32_000);
    }
}
