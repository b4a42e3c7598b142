//! Element Types
//!
//! Keys, stored elements and the metadata that drives TTL/TTI expiry and
//! eviction scoring.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::transaction::SoftLockId;

/// Fixed per-element bookkeeping cost used for byte-capacity accounting
pub const ELEMENT_OVERHEAD_BYTES: u64 = 96;

/// Cache key with a pre-computed hash
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CacheKey {
    hash: u64,
    key: Arc<str>,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(key: impl AsRef<str>) -> Self {
        let key: Arc<str> = Arc::from(key.as_ref());
        Self {
            hash: Self::fx_hash(key.as_bytes()),
            key,
        }
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Key text
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Pre-computed hash
    #[inline]
    pub fn hash_code(&self) -> u64 {
        self.hash
    }

    /// Stripe or shard index for a power-of-two `count`
    #[inline]
    pub fn shard_index(&self, count: usize) -> usize {
        (self.hash as usize) & (count - 1)
    }

    /// Serialized length of the key
    #[inline]
    pub fn len(&self) -> usize {
        self.key.len()
    }

    /// Whether the key text is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.key == other.key
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<u64> for CacheKey {
    fn from(value: u64) -> Self {
        Self::new(value.to_string())
    }
}

impl From<i64> for CacheKey {
    fn from(value: i64) -> Self {
        Self::new(value.to_string())
    }
}

impl From<CacheKey> for String {
    fn from(value: CacheKey) -> Self {
        value.key.to_string()
    }
}

/// What a stored element currently holds
#[derive(Clone, Debug)]
pub enum ElementValue {
    /// Committed payload
    Data(Bytes),
    /// Shadow installed by an in-flight transaction
    SoftLocked(Arc<SoftLockId>),
}

/// Bookkeeping consulted by eviction policies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionData {
    /// Store tick at first insertion
    pub insert_tick: u64,
    /// Store tick at last access (or insertion)
    pub access_tick: u64,
    /// Clock reference bit
    pub referenced: bool,
}

/// A cached key/value pair plus expiry and eviction metadata
#[derive(Clone, Debug)]
pub struct Element {
    key: CacheKey,
    value: ElementValue,
    version: u64,
    creation_time: u64,
    last_access_time: u64,
    last_update_time: u64,
    hit_count: u64,
    time_to_live: Option<u32>,
    time_to_idle: Option<u32>,
    eternal: bool,
    pinned: bool,
    pub(crate) eviction: EvictionData,
}

impl Element {
    /// Create a new element; timestamps are stamped when it enters a store
    pub fn new(key: impl Into<CacheKey>, value: impl Into<Bytes>) -> Self {
        Self::with_value(key.into(), ElementValue::Data(value.into()))
    }

    pub(crate) fn with_value(key: CacheKey, value: ElementValue) -> Self {
        Self {
            key,
            value,
            version: 1,
            creation_time: 0,
            last_access_time: 0,
            last_update_time: 0,
            hit_count: 0,
            time_to_live: None,
            time_to_idle: None,
            eternal: false,
            pinned: false,
            eviction: EvictionData::default(),
        }
    }

    /// Create a shadow element that carries a soft lock instead of a value
    pub(crate) fn soft_locked(key: CacheKey, id: Arc<SoftLockId>) -> Self {
        Self::with_value(key, ElementValue::SoftLocked(id))
    }

    /// Set time-to-live in seconds (0 = unlimited)
    pub fn with_time_to_live(mut self, seconds: u32) -> Self {
        self.time_to_live = Some(seconds);
        self
    }

    /// Set time-to-idle in seconds (0 = unlimited)
    pub fn with_time_to_idle(mut self, seconds: u32) -> Self {
        self.time_to_idle = Some(seconds);
        self
    }

    /// Mark the element as never expiring
    pub fn eternal(mut self) -> Self {
        self.eternal = true;
        self
    }

    /// Mark the element as non-evictable
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Payload, or `None` when the element is a soft-lock shadow
    #[inline]
    pub fn value(&self) -> Option<&Bytes> {
        match &self.value {
            ElementValue::Data(bytes) => Some(bytes),
            ElementValue::SoftLocked(_) => None,
        }
    }

    #[inline]
    pub fn element_value(&self) -> &ElementValue {
        &self.value
    }

    /// Soft lock id when this element is a transactional shadow
    #[inline]
    pub fn soft_lock_id(&self) -> Option<&Arc<SoftLockId>> {
        match &self.value {
            ElementValue::SoftLocked(id) => Some(id),
            ElementValue::Data(_) => None,
        }
    }

    #[inline]
    pub fn is_soft_locked(&self) -> bool {
        matches!(self.value, ElementValue::SoftLocked(_))
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    #[inline]
    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    #[inline]
    pub fn last_access_time(&self) -> u64 {
        self.last_access_time
    }

    #[inline]
    pub fn last_update_time(&self) -> u64 {
        self.last_update_time
    }

    /// Effective TTL in seconds (0 when unset)
    #[inline]
    pub fn time_to_live(&self) -> u32 {
        self.time_to_live.unwrap_or(0)
    }

    /// Effective TTI in seconds (0 when unset)
    #[inline]
    pub fn time_to_idle(&self) -> u32 {
        self.time_to_idle.unwrap_or(0)
    }

    /// Whether TTL or TTI was set explicitly (or by cache defaults)
    #[inline]
    pub fn is_lifespan_set(&self) -> bool {
        self.time_to_live.is_some() || self.time_to_idle.is_some()
    }

    /// Eternal elements never expire; soft-lock shadows are always eternal
    pub fn is_eternal(&self) -> bool {
        self.eternal
            || self.is_soft_locked()
            || (self.is_lifespan_set() && self.time_to_live() == 0 && self.time_to_idle() == 0)
    }

    /// Pinned elements are excluded from eviction sampling
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned || self.is_soft_locked()
    }

    /// Absolute expiry instant in milliseconds (`u64::MAX` if never)
    pub fn expiration_time(&self) -> u64 {
        if !self.is_lifespan_set() || self.is_eternal() {
            return u64::MAX;
        }

        let ttl = self.time_to_live() as u64 * 1000;
        let tti = self.time_to_idle() as u64 * 1000;
        let ttl_expiry = self.creation_time.saturating_add(ttl);
        let most_recent = self.creation_time.max(self.last_access_time);
        let tti_expiry = most_recent.saturating_add(tti);

        if ttl != 0 && (tti == 0 || self.last_access_time == 0) {
            ttl_expiry
        } else if ttl == 0 {
            tti_expiry
        } else {
            ttl_expiry.min(tti_expiry)
        }
    }

    /// Whether the element has expired at `now_millis`
    #[inline]
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.is_lifespan_set() && now_millis > self.expiration_time()
    }

    /// Approximate footprint used for byte-based capacities
    pub fn size_in_bytes(&self) -> u64 {
        let payload = match &self.value {
            ElementValue::Data(bytes) => bytes.len() as u64,
            ElementValue::SoftLocked(id) => {
                id.new_element().map_or(0, |e| e.size_in_bytes())
                    + id.old_element().map_or(0, |e| e.size_in_bytes())
            }
        };
        self.key.len() as u64 + payload + ELEMENT_OVERHEAD_BYTES
    }

    /// Inherit cache-wide lifespan defaults when none was set on the element
    pub(crate) fn apply_default_lifespan(&mut self, ttl: u32, tti: u32, eternal: bool) {
        if eternal {
            self.eternal = true;
        } else if !self.is_lifespan_set() && !self.eternal {
            self.time_to_live = Some(ttl);
            self.time_to_idle = Some(tti);
        }
    }

    /// Stamp a fresh insertion
    pub(crate) fn stamp_insert(&mut self, now: u64, tick: u64) {
        if self.creation_time == 0 {
            self.creation_time = now;
        }
        self.eviction = EvictionData {
            insert_tick: tick,
            access_tick: tick,
            referenced: false,
        };
    }

    /// Stamp an update over `previous`: keeps insertion order, bumps version
    pub(crate) fn stamp_update(&mut self, previous: &Element, now: u64, tick: u64) {
        if self.creation_time == 0 {
            self.creation_time = now;
        }
        self.last_update_time = now;
        self.version = previous.version + 1;
        self.hit_count = previous.hit_count;
        self.eviction = EvictionData {
            insert_tick: previous.eviction.insert_tick,
            access_tick: tick,
            referenced: true,
        };
    }

    /// Record an observable read
    pub(crate) fn record_access(&mut self, now: u64, tick: u64) {
        self.last_access_time = now;
        self.hit_count += 1;
        self.eviction.access_tick = tick;
        self.eviction.referenced = true;
    }

    /// Clear the Clock reference bit
    pub(crate) fn clear_reference(&mut self) {
        self.eviction.referenced = false;
    }
}

/// Serialized form of an element for the off-heap and disk tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredElement {
    key: CacheKey,
    value: Bytes,
    version: u64,
    creation_time: u64,
    last_access_time: u64,
    last_update_time: u64,
    hit_count: u64,
    time_to_live: Option<u32>,
    time_to_idle: Option<u32>,
    eternal: bool,
    pinned: bool,
    eviction: EvictionData,
}

impl StoredElement {
    /// Soft-lock shadows stay on heap and cannot be serialized
    pub(crate) fn from_element(element: &Element) -> Option<Self> {
        let value = element.value()?.clone();
        Some(Self {
            key: element.key.clone(),
            value,
            version: element.version,
            creation_time: element.creation_time,
            last_access_time: element.last_access_time,
            last_update_time: element.last_update_time,
            hit_count: element.hit_count,
            time_to_live: element.time_to_live,
            time_to_idle: element.time_to_idle,
            eternal: element.eternal,
            pinned: element.pinned,
            eviction: element.eviction,
        })
    }

    pub(crate) fn into_element(self) -> Element {
        Element {
            key: self.key,
            value: ElementValue::Data(self.value),
            version: self.version,
            creation_time: self.creation_time,
            last_access_time: self.last_access_time,
            last_update_time: self.last_update_time,
            hit_count: self.hit_count,
            time_to_live: self.time_to_live,
            time_to_idle: self.time_to_idle,
            eternal: self.eternal,
            pinned: self.pinned,
            eviction: self.eviction,
        }
    }
}

/// Value equality used by the compare-and-swap operations
pub trait ElementValueComparator: Send + Sync {
    fn equals(&self, a: &Element, b: &Element) -> bool;
}

/// Compares payload bytes; soft-lock shadows match only the same lock
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultElementValueComparator;

impl ElementValueComparator for DefaultElementValueComparator {
    fn equals(&self, a: &Element, b: &Element) -> bool {
        match (&a.value, &b.value) {
            (ElementValue::Data(x), ElementValue::Data(y)) => x == y,
            (ElementValue::SoftLocked(x), ElementValue::SoftLocked(y)) => {
                Arc::ptr_eq(x, y) || **x == **y
            }
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_000_000;

    fn stamped(element: Element, now: u64) -> Element {
        let mut element = element;
        element.stamp_insert(now, 1);
        element
    }

    #[test]
    fn test_cache_key_equality_and_hash() {
        let a = CacheKey::from("alpha");
        let b = CacheKey::new("alpha");
        let c = CacheKey::from(42u64);

        assert_eq!(a, b);
        assert_eq!(a.hash_code(), b.hash_code());
        assert_ne!(a, c);
        assert_eq!(c.as_str(), "42");
    }

    #[test]
    fn test_shard_index_in_range() {
        for i in 0..1000u64 {
            assert!(CacheKey::from(i).shard_index(64) < 64);
        }
    }

    #[test]
    fn test_no_lifespan_never_expires() {
        let element = stamped(Element::new("k", "v"), T0);
        assert!(!element.is_lifespan_set());
        assert!(!element.is_expired(u64::MAX - 1));
    }

    #[test]
    fn test_time_to_live_expiry() {
        let element = stamped(Element::new("k", "v").with_time_to_live(5), T0);
        assert!(!element.is_expired(T0 + 5_000));
        assert!(element.is_expired(T0 + 5_001));
    }

    #[test]
    fn test_time_to_idle_slides_with_access() {
        let mut element = stamped(Element::new("k", "v").with_time_to_idle(10), T0);
        element.record_access(T0 + 6_000, 2);
        assert!(!element.is_expired(T0 + 15_000));
        assert!(element.is_expired(T0 + 17_000));
    }

    #[test]
    fn test_ttl_caps_tti() {
        let mut element = stamped(
            Element::new("k", "v").with_time_to_live(10).with_time_to_idle(8),
            T0,
        );
        element.record_access(T0 + 7_000, 2);
        // TTI would extend to T0+15s but TTL ends at T0+10s
        assert_eq!(element.expiration_time(), T0 + 10_000);
    }

    #[test]
    fn test_zero_ttl_and_tti_is_eternal() {
        let element = stamped(
            Element::new("k", "v").with_time_to_live(0).with_time_to_idle(0),
            T0,
        );
        assert!(element.is_eternal());
        assert_eq!(element.expiration_time(), u64::MAX);
    }

    #[test]
    fn test_default_lifespan_only_when_unset() {
        let mut inherits = Element::new("a", "v");
        inherits.apply_default_lifespan(30, 0, false);
        assert_eq!(inherits.time_to_live(), 30);

        let mut explicit = Element::new("b", "v").with_time_to_live(5);
        explicit.apply_default_lifespan(30, 0, false);
        assert_eq!(explicit.time_to_live(), 5);

        let mut eternal = Element::new("c", "v").with_time_to_live(5);
        eternal.apply_default_lifespan(30, 0, true);
        assert!(eternal.is_eternal());
    }

    #[test]
    fn test_update_preserves_insert_order_and_bumps_version() {
        let mut first = stamped(Element::new("k", "v1"), T0);
        first.record_access(T0 + 1, 2);

        let mut second = Element::new("k", "v2");
        second.stamp_update(&first, T0 + 2, 3);

        assert_eq!(second.version(), 2);
        assert_eq!(second.hit_count(), 1);
        assert_eq!(second.eviction.insert_tick, 1);
        assert_eq!(second.eviction.access_tick, 3);
        assert_eq!(second.last_update_time(), T0 + 2);
    }

    #[test]
    fn test_stored_element_roundtrip_keeps_metadata() {
        let mut element = stamped(Element::new("k", "payload").with_time_to_idle(3), T0);
        element.record_access(T0 + 10, 7);

        let stored = StoredElement::from_element(&element).unwrap();
        let json = serde_json::to_vec(&stored).unwrap();
        let restored: StoredElement = serde_json::from_slice(&json).unwrap();
        let restored = restored.into_element();

        assert_eq!(restored.value().unwrap().as_ref(), b"payload");
        assert_eq!(restored.hit_count(), 1);
        assert_eq!(restored.eviction.access_tick, 7);
        assert_eq!(restored.time_to_idle(), 3);
    }

    #[test]
    fn test_default_comparator() {
        let cmp = DefaultElementValueComparator;
        let a = Element::new("k", "same");
        let b = Element::new("k", "same");
        let c = Element::new("k", "other");
        assert!(cmp.equals(&a, &b));
        assert!(!cmp.equals(&a, &c));
    }
}
