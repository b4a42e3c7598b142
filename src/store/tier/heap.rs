//! Heap Tier
//!
//! Live elements in a sharded map, weighted by `Element::size_in_bytes`.

use super::{EntryMeta, PinnedCount, Tier, TierCapacity, TierKind, TIER_SHARDS};
use crate::error::Result;
use crate::store::element::{CacheKey, Element};
use crate::store::policy::Candidate;
use crate::store::shard::ShardedMap;

/// Fastest tier; holds soft-lock shadows as well as committed values
pub struct HeapTier {
    storage: ShardedMap<Element, TIER_SHARDS>,
    pinned: PinnedCount,
    capacity: TierCapacity,
}

impl HeapTier {
    pub fn new(capacity: TierCapacity) -> Self {
        Self {
            storage: ShardedMap::new(),
            pinned: PinnedCount::default(),
            capacity,
        }
    }
}

impl Tier for HeapTier {
    fn kind(&self) -> TierKind {
        TierKind::OnHeap
    }

    fn capacity(&self) -> TierCapacity {
        self.capacity
    }

    fn len(&self) -> usize {
        self.storage.len()
    }

    fn pinned_len(&self) -> usize {
        self.pinned.get()
    }

    fn size_bytes(&self) -> u64 {
        self.storage.size_bytes()
    }

    fn contains_key(&self, key: &CacheKey) -> bool {
        self.storage.contains_key(key)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Element>> {
        Ok(self.storage.get(key))
    }

    fn put(&self, element: Element) -> Result<Option<Element>> {
        let weight = element.size_in_bytes();
        let pinned = element.is_pinned();
        let displaced = self.storage.insert(element.key().clone(), element, weight);
        self.pinned
            .replace(displaced.as_ref().map(Element::is_pinned), Some(pinned));
        Ok(displaced)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Element>> {
        let removed = self.storage.remove(key);
        self.pinned
            .replace(removed.as_ref().map(Element::is_pinned), None);
        Ok(removed)
    }

    fn touch(&self, key: &CacheKey, now: u64, tick: u64) -> Result<Option<Element>> {
        Ok(self.storage.update(key, |element| {
            element.record_access(now, tick);
            element.clone()
        }))
    }

    fn clear_reference(&self, key: &CacheKey) {
        self.storage.update(key, |element| element.clear_reference());
    }

    fn sample(
        &self,
        start: usize,
        limit: usize,
        filter: &dyn Fn(&Candidate) -> bool,
    ) -> Vec<Candidate> {
        self.storage.sample(start, limit, |key, element| {
            let candidate = EntryMeta::of(element).candidate(key);
            filter(&candidate).then_some(candidate)
        })
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.storage.keys()
    }

    fn clear(&self) -> Result<usize> {
        let removed = self.storage.clear();
        self.pinned.reset();
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_put_replace_accounts_bytes() {
        let tier = HeapTier::new(TierCapacity::entries(2));
        tier.put(Element::new("a", "1")).unwrap();
        let first = tier.size_bytes();

        let displaced = tier.put(Element::new("a", "longer value")).unwrap();
        assert!(displaced.is_some());
        assert_eq!(tier.len(), 1);
        assert!(tier.size_bytes() > first);
    }

    #[test]
    fn test_heap_tracks_pinned_entries() {
        let tier = HeapTier::new(TierCapacity::default());
        tier.put(Element::new("a", "1").pinned()).unwrap();
        tier.put(Element::new("b", "1")).unwrap();
        assert_eq!(tier.pinned_len(), 1);
        assert_eq!(tier.evictable_len(), 1);

        tier.put(Element::new("b", "2").pinned()).unwrap();
        assert_eq!(tier.evictable_len(), 0);

        tier.put(Element::new("a", "2")).unwrap();
        tier.remove(&CacheKey::new("b")).unwrap();
        assert_eq!(tier.pinned_len(), 0);
        assert_eq!(tier.evictable_len(), 1);

        tier.put(Element::new("c", "1").pinned()).unwrap();
        tier.clear().unwrap();
        assert_eq!(tier.pinned_len(), 0);
    }

    #[test]
    fn test_heap_touch_records_access() {
        let tier = HeapTier::new(TierCapacity::default());
        tier.put(Element::new("a", "1")).unwrap();

        let touched = tier.touch(&CacheKey::new("a"), 42, 7).unwrap().unwrap();
        assert_eq!(touched.hit_count(), 1);
        assert_eq!(touched.last_access_time(), 42);
        assert!(tier.touch(&CacheKey::new("missing"), 42, 8).unwrap().is_none());
    }

    #[test]
    fn test_heap_sample_skips_pinned() {
        let tier = HeapTier::new(TierCapacity::default());
        tier.put(Element::new("free", "1")).unwrap();
        tier.put(Element::new("held", "1").pinned()).unwrap();

        let sampled = tier.sample(0, 10, &|c| !c.pinned);
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled[0].key.as_str(), "free");
    }

    #[test]
    fn test_heap_over_capacity() {
        let tier = HeapTier::new(TierCapacity::entries(1));
        tier.put(Element::new("a", "1")).unwrap();
        assert!(!tier.is_over_capacity());
        tier.put(Element::new("b", "1")).unwrap();
        assert!(tier.is_over_capacity());
    }
}
