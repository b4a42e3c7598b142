//! Storage Tiers
//!
//! Each tier is a bounded container of elements:
//!
//! - **Heap**: live `Element` values, the only tier that may hold soft-lock
//!   shadows
//! - **Off-heap**: serialized records kept in memory
//! - **Disk**: append-only record file with an in-memory index
//!
//! Tiers do no locking beyond their own maps; the tiered store serializes
//! all access to a key through its stripe lock.

pub mod disk;
pub mod heap;
pub mod offheap;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::element::{CacheKey, Element, EvictionData};
use super::policy::Candidate;
use crate::error::Result;

pub use disk::DiskTier;
pub use heap::HeapTier;
pub use offheap::OffHeapTier;

/// Shard count used by every tier map
pub const TIER_SHARDS: usize = 64;

/// Tier identity, fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    OnHeap,
    OffHeap,
    OnDisk,
}

impl TierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TierKind::OnHeap => "heap",
            TierKind::OffHeap => "offheap",
            TierKind::OnDisk => "disk",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry and byte bounds of a tier; zero means unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCapacity {
    #[serde(default)]
    pub max_entries: u64,
    #[serde(default)]
    pub max_bytes: u64,
}

impl TierCapacity {
    pub fn entries(max_entries: u64) -> Self {
        Self {
            max_entries,
            max_bytes: 0,
        }
    }

    pub fn bytes(max_bytes: u64) -> Self {
        Self {
            max_entries: 0,
            max_bytes,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.max_entries > 0 || self.max_bytes > 0
    }

    /// Whether `entries`/`bytes` exceed either bound
    pub fn is_exceeded(&self, entries: u64, bytes: u64) -> bool {
        (self.max_entries > 0 && entries > self.max_entries)
            || (self.max_bytes > 0 && bytes > self.max_bytes)
    }
}

/// Metadata kept beside serialized records so sampling needs no decoding
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryMeta {
    pub eviction: EvictionData,
    pub hit_count: u64,
    pub expiration_time: u64,
    pub pinned: bool,
}

impl EntryMeta {
    pub(crate) fn of(element: &Element) -> Self {
        Self {
            eviction: element.eviction,
            hit_count: element.hit_count(),
            expiration_time: element.expiration_time(),
            pinned: element.is_pinned(),
        }
    }

    pub(crate) fn candidate(&self, key: &CacheKey) -> Candidate {
        Candidate {
            key: key.clone(),
            eviction: self.eviction,
            hit_count: self.hit_count,
            expiration_time: self.expiration_time,
            pinned: self.pinned,
        }
    }
}

/// Number of pinned entries a tier holds
#[derive(Debug, Default)]
pub(crate) struct PinnedCount(AtomicUsize);

impl PinnedCount {
    /// Account for `incoming` taking the place of `displaced` under one key
    pub(crate) fn replace(&self, displaced: Option<bool>, incoming: Option<bool>) {
        match (displaced == Some(true), incoming == Some(true)) {
            (false, true) => {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                let _ = self
                    .0
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            }
            _ => {}
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// A bounded element container
pub trait Tier: Send + Sync {
    fn kind(&self) -> TierKind;

    fn capacity(&self) -> TierCapacity;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries that eviction must skip
    fn pinned_len(&self) -> usize;

    fn evictable_len(&self) -> usize {
        self.len().saturating_sub(self.pinned_len())
    }

    /// Bytes accounted against `capacity().max_bytes`
    fn size_bytes(&self) -> u64;

    fn is_over_capacity(&self) -> bool {
        self.capacity()
            .is_exceeded(self.len() as u64, self.size_bytes())
    }

    fn contains_key(&self, key: &CacheKey) -> bool;

    fn get(&self, key: &CacheKey) -> Result<Option<Element>>;

    /// Insert or replace, returning the displaced element
    fn put(&self, element: Element) -> Result<Option<Element>>;

    fn remove(&self, key: &CacheKey) -> Result<Option<Element>>;

    /// Record a read in place and return the updated element
    fn touch(&self, key: &CacheKey, now: u64, tick: u64) -> Result<Option<Element>> {
        match self.get(key)? {
            Some(mut element) => {
                element.record_access(now, tick);
                self.put(element.clone())?;
                Ok(Some(element))
            }
            None => Ok(None),
        }
    }

    /// Clear the Clock reference bit of `key`
    fn clear_reference(&self, key: &CacheKey);

    /// Up to `limit` candidates accepted by `filter`, walking shards from `start`
    fn sample(
        &self,
        start: usize,
        limit: usize,
        filter: &dyn Fn(&Candidate) -> bool,
    ) -> Vec<Candidate>;

    fn keys(&self) -> Vec<CacheKey>;

    /// Drop every entry, returning how many were removed
    fn clear(&self) -> Result<usize>;

    fn shard_count(&self) -> usize {
        TIER_SHARDS
    }
}

// =============================================================================
// Tests
// =============================================================================
