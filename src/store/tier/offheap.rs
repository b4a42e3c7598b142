//! Off-Heap Tier
//!
//! Elements kept as serialized records in memory. Byte accounting uses the
//! encoded record length, so this tier is usually bounded by `max_bytes`.

use bytes::Bytes;

use super::{EntryMeta, PinnedCount, Tier, TierCapacity, TierKind, TIER_SHARDS};
use crate::error::{Error, Result};
use crate::store::element::{CacheKey, Element, StoredElement};
use crate::store::policy::Candidate;
use crate::store::shard::ShardedMap;

#[derive(Clone)]
struct Record {
    encoded: Bytes,
    meta: EntryMeta,
}

/// Serialized in-memory tier
pub struct OffHeapTier {
    storage: ShardedMap<Record, TIER_SHARDS>,
    pinned: PinnedCount,
    capacity: TierCapacity,
}

impl OffHeapTier {
    pub fn new(capacity: TierCapacity) -> Self {
        Self {
            storage: ShardedMap::new(),
            pinned: PinnedCount::default(),
            capacity,
        }
    }

    fn encode(element: &Element) -> Result<Bytes> {
        let stored = StoredElement::from_element(element).ok_or_else(|| {
            Error::Internal(format!(
                "soft-locked element {} cannot leave the heap tier",
                element.key()
            ))
        })?;
        Ok(Bytes::from(serde_json::to_vec(&stored)?))
    }

    fn decode(record: &Record) -> Result<Element> {
        let stored: StoredElement = serde_json::from_slice(&record.encoded)?;
        Ok(stored.into_element())
    }
}

impl Tier for OffHeapTier {
    fn kind(&self) -> TierKind {
        TierKind::OffHeap
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
        self.storage.get(key).map(|r| Self::decode(&r)).transpose()
    }

    fn put(&self, element: Element) -> Result<Option<Element>> {
        let encoded = Self::encode(&element)?;
        let record = Record {
            meta: EntryMeta::of(&element),
            encoded,
        };
        let weight = record.encoded.len() as u64;
        let pinned = record.meta.pinned;
        let displaced = self.storage.insert(element.key().clone(), record, weight);
        self.pinned
            .replace(displaced.as_ref().map(|r| r.meta.pinned), Some(pinned));
        displaced.map(|r| Self::decode(&r)).transpose()
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Element>> {
        let removed = self.storage.remove(key);
        self.pinned
            .replace(removed.as_ref().map(|r| r.meta.pinned), None);
        removed.map(|r| Self::decode(&r)).transpose()
    }

    fn clear_reference(&self, key: &CacheKey) {
        self.storage
            .update(key, |record| record.meta.eviction.referenced = false);
    }

    fn sample(
        &self,
        start: usize,
        limit: usize,
        filter: &dyn Fn(&Candidate) -> bool,
    ) -> Vec<Candidate> {
        self.storage.sample(start, limit, |key, record| {
            let candidate = record.meta.candidate(key);
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
    use crate::transaction::{SoftLockId, TransactionId};
    use std::sync::Arc;

    #[test]
    fn test_offheap_roundtrip_keeps_lifespan() {
        let tier = OffHeapTier::new(TierCapacity::bytes(1 << 20));
        tier.put(Element::new("k", "payload").with_time_to_live(30))
            .unwrap();

        let element = tier.get(&CacheKey::new("k")).unwrap().unwrap();
        assert_eq!(element.value().unwrap().as_ref(), b"payload");
        assert_eq!(element.time_to_live(), 30);
        assert!(tier.size_bytes() > 0);
    }

    #[test]
    fn test_offheap_rejects_soft_locked() {
        let tier = OffHeapTier::new(TierCapacity::default());
        let key = CacheKey::new("k");
        let id = SoftLockId::new(TransactionId::new(), key.clone(), None, None);
        let shadow = Element::soft_locked(key, Arc::new(id));

        assert!(matches!(tier.put(shadow), Err(Error::Internal(_))));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_offheap_clear_reference() {
        let tier = OffHeapTier::new(TierCapacity::default());
        let mut element = Element::new("k", "v");
        element.record_access(10, 2);
        tier.put(element).unwrap();

        assert!(tier.sample(0, 1, &|_| true)[0].eviction.referenced);
        tier.clear_reference(&CacheKey::new("k"));
        assert!(!tier.sample(0, 1, &|_| true)[0].eviction.referenced);
    }
}
