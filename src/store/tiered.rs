//! Tiered Store
//!
//! Up to three capacity-bounded tiers (heap → off-heap → disk) behind a
//! single key space.
//!
//! # Design
//!
//! - Every key maps to one of 1024 stripe locks; all reads and writes of a
//!   key, including promotion and demotion between tiers, happen under it
//! - Writes always land in the heap tier; an over-capacity tier evicts by
//!   sampling and demotes its victim into the next tier
//! - Eviction locks victims with `try_lock` and skips contended ones
//! - Listener events are collected under the locks and dispatched after
//!   they are released
//!
//! Soft-lock shadows are invisible to listeners and put/update/remove
//! statistics; the transactional layer reports its own outcomes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use tracing::{debug, instrument, trace, warn};

use super::clock::{Clock, SystemClock};
use super::element::{CacheKey, Element, ElementValueComparator};
use super::evictor::BackgroundEvictor;
use super::policy::{sample_size, Candidate, EvictionPolicyKind, Policy};
use super::tier::{DiskTier, HeapTier, OffHeapTier, Tier, TierCapacity, TierKind};
use crate::error::Result;
use crate::event::{CacheEvent, ListenerRegistry};
use crate::statistics::{CacheStatistics, StatisticsSnapshot};

/// Number of per-key stripe locks
pub const STRIPE_COUNT: usize = 1024;

/// Consecutive fruitless eviction rounds before a tier is left over its bound
const MAX_EVICTION_STALLS: usize = 8;

/// When capacity is enforced after a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionMode {
    /// Inside the writing call
    #[default]
    Synchronous,
    /// On a dedicated evictor thread; tiers may briefly exceed their bound
    Background,
}

/// Cache-wide lifespan defaults applied to elements that set none
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifespanDefaults {
    pub time_to_live: u32,
    pub time_to_idle: u32,
    pub eternal: bool,
}

/// Builder for [`TieredStore`]
pub struct TieredStoreBuilder {
    name: String,
    heap: TierCapacity,
    offheap: Option<TierCapacity>,
    disk: Option<(PathBuf, TierCapacity)>,
    policy: EvictionPolicyKind,
    lifespan: LifespanDefaults,
    pin_all: bool,
    eviction_mode: EvictionMode,
    clock: Arc<dyn Clock>,
    statistics: Arc<CacheStatistics>,
    listeners: Arc<ListenerRegistry>,
}

impl TieredStoreBuilder {
    pub fn heap(mut self, capacity: TierCapacity) -> Self {
        self.heap = capacity;
        self
    }

    pub fn offheap(mut self, capacity: TierCapacity) -> Self {
        self.offheap = Some(capacity);
        self
    }

    pub fn disk(mut self, path: impl Into<PathBuf>, capacity: TierCapacity) -> Self {
        self.disk = Some((path.into(), capacity));
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicyKind) -> Self {
        self.policy = policy;
        self
    }

    pub fn lifespan(mut self, lifespan: LifespanDefaults) -> Self {
        self.lifespan = lifespan;
        self
    }

    /// Pin every element written to the store
    pub fn pin_all(mut self, pin_all: bool) -> Self {
        self.pin_all = pin_all;
        self
    }

    pub fn eviction_mode(mut self, mode: EvictionMode) -> Self {
        self.eviction_mode = mode;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn statistics(mut self, statistics: Arc<CacheStatistics>) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn listeners(mut self, listeners: Arc<ListenerRegistry>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn build(self) -> Result<Arc<TieredStore>> {
        let mut tiers: Vec<Box<dyn Tier>> = vec![Box::new(HeapTier::new(self.heap))];
        if let Some(capacity) = self.offheap {
            tiers.push(Box::new(OffHeapTier::new(capacity)));
        }
        if let Some((path, capacity)) = self.disk {
            tiers.push(Box::new(DiskTier::open(path, capacity)?));
        }

        let stripes: Vec<Mutex<()>> = (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect();
        let hands = tiers.iter().map(|_| AtomicUsize::new(0)).collect();

        let store = Arc::new(TieredStore {
            name: self.name,
            tiers,
            stripes: stripes.into_boxed_slice(),
            policy: self.policy.build(),
            policy_kind: self.policy,
            clock: self.clock,
            tick: AtomicU64::new(0),
            hands,
            lifespan: self.lifespan,
            pin_all: self.pin_all,
            statistics: self.statistics,
            listeners: self.listeners,
            evictor: OnceLock::new(),
        });

        if self.eviction_mode == EvictionMode::Background {
            let evictor = BackgroundEvictor::spawn(&store)?;
            // Freshly built store: the cell is empty
            let _ = store.evictor.set(evictor);
        }

        debug!(
            cache = %store.name,
            tiers = store.tiers.len(),
            policy = %store.policy_kind,
            "Built tiered store"
        );
        Ok(store)
    }
}

/// Element store spanning heap, off-heap and disk tiers
pub struct TieredStore {
    name: String,
    tiers: Vec<Box<dyn Tier>>,
    stripes: Box<[Mutex<()>]>,
    policy: Box<dyn Policy>,
    policy_kind: EvictionPolicyKind,
    clock: Arc<dyn Clock>,
    tick: AtomicU64,
    hands: Vec<AtomicUsize>,
    lifespan: LifespanDefaults,
    pin_all: bool,
    statistics: Arc<CacheStatistics>,
    listeners: Arc<ListenerRegistry>,
    evictor: OnceLock<BackgroundEvictor>,
}

impl TieredStore {
    /// Start building a store with an unbounded heap tier and LRU eviction
    pub fn builder(name: impl Into<String>) -> TieredStoreBuilder {
        TieredStoreBuilder {
            name: name.into(),
            heap: TierCapacity::default(),
            offheap: None,
            disk: None,
            policy: EvictionPolicyKind::default(),
            lifespan: LifespanDefaults::default(),
            pin_all: false,
            eviction_mode: EvictionMode::default(),
            clock: Arc::new(SystemClock),
            statistics: Arc::new(CacheStatistics::new()),
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn eviction_policy(&self) -> EvictionPolicyKind {
        self.policy_kind
    }

    pub fn lifespan(&self) -> LifespanDefaults {
        self.lifespan
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn statistics(&self) -> &Arc<CacheStatistics> {
        &self.statistics
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Tier kinds present, fastest first
    pub fn tier_kinds(&self) -> Vec<TierKind> {
        self.tiers.iter().map(|t| t.kind()).collect()
    }

    /// Tier currently holding `key`, if any
    pub fn tier_of(&self, key: &CacheKey) -> Option<TierKind> {
        let _guard = self.lock_stripe(key);
        self.tiers
            .iter()
            .find(|t| t.contains_key(key))
            .map(|t| t.kind())
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    /// Insert or update; `true` when the key was absent
    #[instrument(skip(self, element), fields(cache = %self.name, key = %element.key()))]
    pub fn put(&self, element: Element) -> Result<bool> {
        let key = element.key().clone();
        let mut events = Vec::new();
        let inserted = {
            let stripe = self.stripe_index(&key);
            let _guard = self.stripes[stripe].lock();
            let now = self.clock.now_millis();

            let previous = self.take_current(&key, now, &mut events)?;
            let installed = self.install(element, previous.as_ref(), now)?;
            self.record_write(&installed, previous.as_ref(), &mut events);
            self.after_write(&key, stripe, &mut events)?;
            previous.is_none()
        };
        self.listeners.dispatch_all(&events);
        Ok(inserted)
    }

    /// Insert unless a live mapping exists; returns the existing element
    pub fn put_if_absent(&self, element: Element) -> Result<Option<Element>> {
        let key = element.key().clone();
        let mut events = Vec::new();
        let existing = {
            let stripe = self.stripe_index(&key);
            let _guard = self.stripes[stripe].lock();
            let now = self.clock.now_millis();

            match self.current(&key, now, &mut events)? {
                Some((_, existing)) => Some(existing),
                None => {
                    let installed = self.install(element, None, now)?;
                    self.record_write(&installed, None, &mut events);
                    self.after_write(&key, stripe, &mut events)?;
                    None
                }
            }
        };
        self.listeners.dispatch_all(&events);
        Ok(existing)
    }

    /// Observable read: updates access metadata and statistics, promotes
    pub fn get(&self, key: &CacheKey) -> Result<Option<Element>> {
        let started = Instant::now();
        let mut events = Vec::new();
        let found = {
            let stripe = self.stripe_index(key);
            let _guard = self.stripes[stripe].lock();
            self.lookup(key, stripe, &mut events)?
        };
        self.statistics.record_get_latency(started.elapsed());
        self.listeners.dispatch_all(&events);
        Ok(found)
    }

    /// Non-observable read: no statistics, events, metadata or promotion
    pub fn get_quiet(&self, key: &CacheKey) -> Result<Option<Element>> {
        let _guard = self.lock_stripe(key);
        let now = self.clock.now_millis();
        for tier in &self.tiers {
            if let Some(element) = tier.get(key)? {
                return Ok((!element.is_expired(now)).then_some(element));
            }
        }
        Ok(None)
    }

    /// Remove from whichever tier holds the key
    pub fn remove(&self, key: &CacheKey) -> Result<Option<Element>> {
        let mut events = Vec::new();
        let removed = {
            let _guard = self.lock_stripe(key);
            let now = self.clock.now_millis();
            match self.current(key, now, &mut events)? {
                Some((idx, _)) => {
                    let removed = self.tiers[idx].remove(key)?;
                    if let Some(element) = &removed {
                        self.record_remove(element, &mut events);
                    }
                    removed
                }
                None => None,
            }
        };
        self.listeners.dispatch_all(&events);
        Ok(removed)
    }

    /// Remove only if the resident value equals `element`
    pub fn remove_element(
        &self,
        element: &Element,
        comparator: &dyn ElementValueComparator,
    ) -> Result<Option<Element>> {
        let key = element.key();
        let mut events = Vec::new();
        let removed = {
            let _guard = self.lock_stripe(key);
            let now = self.clock.now_millis();
            match self.current(key, now, &mut events)? {
                Some((idx, current)) if comparator.equals(&current, element) => {
                    let removed = self.tiers[idx].remove(key)?;
                    if let Some(element) = &removed {
                        self.record_remove(element, &mut events);
                    }
                    removed
                }
                _ => None,
            }
        };
        self.listeners.dispatch_all(&events);
        Ok(removed)
    }

    /// Swap in `new` only if the resident value equals `old`
    pub fn replace_element(
        &self,
        old: &Element,
        new: Element,
        comparator: &dyn ElementValueComparator,
    ) -> Result<bool> {
        let key = new.key().clone();
        let mut events = Vec::new();
        let replaced = {
            let stripe = self.stripe_index(&key);
            let _guard = self.stripes[stripe].lock();
            let now = self.clock.now_millis();
            match self.current(&key, now, &mut events)? {
                Some((idx, current)) if comparator.equals(&current, old) => {
                    self.tiers[idx].remove(&key)?;
                    let installed = self.install(new, Some(&current), now)?;
                    self.record_write(&installed, Some(&current), &mut events);
                    self.after_write(&key, stripe, &mut events)?;
                    true
                }
                _ => false,
            }
        };
        self.listeners.dispatch_all(&events);
        Ok(replaced)
    }

    /// Overwrite an existing mapping; absent keys are left absent
    pub fn replace(&self, new: Element) -> Result<Option<Element>> {
        let key = new.key().clone();
        let mut events = Vec::new();
        let previous = {
            let stripe = self.stripe_index(&key);
            let _guard = self.stripes[stripe].lock();
            let now = self.clock.now_millis();
            match self.current(&key, now, &mut events)? {
                Some((idx, current)) => {
                    self.tiers[idx].remove(&key)?;
                    let installed = self.install(new, Some(&current), now)?;
                    self.record_write(&installed, Some(&current), &mut events);
                    self.after_write(&key, stripe, &mut events)?;
                    Some(current)
                }
                None => None,
            }
        };
        self.listeners.dispatch_all(&events);
        Ok(previous)
    }

    /// Drop every element from every tier
    pub fn remove_all(&self) -> Result<usize> {
        let mut removed = 0;
        for tier in &self.tiers {
            removed += tier.clear()?;
        }
        self.listeners
            .dispatch(&CacheEvent::remove_all(&self.name, removed));
        debug!(cache = %self.name, removed, "Removed all elements");
        Ok(removed)
    }

    /// Whether any tier holds `key`; expiry is not checked
    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.tiers.iter().any(|t| t.contains_key(key))
    }

    /// Keys across all tiers (weakly consistent, expired keys included)
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for tier in &self.tiers {
            for key in tier.keys() {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    // =========================================================================
    // Sizes
    // =========================================================================

    pub fn size(&self) -> usize {
        self.tiers.iter().map(|t| t.len()).sum()
    }

    pub fn in_memory_size(&self) -> usize {
        self.tier_len(TierKind::OnHeap)
    }

    pub fn off_heap_size(&self) -> usize {
        self.tier_len(TierKind::OffHeap)
    }

    pub fn on_disk_size(&self) -> usize {
        self.tier_len(TierKind::OnDisk)
    }

    pub fn in_memory_size_bytes(&self) -> u64 {
        self.tier_bytes(TierKind::OnHeap)
    }

    pub fn off_heap_size_bytes(&self) -> u64 {
        self.tier_bytes(TierKind::OffHeap)
    }

    pub fn on_disk_size_bytes(&self) -> u64 {
        self.tier_bytes(TierKind::OnDisk)
    }

    fn tier_len(&self, kind: TierKind) -> usize {
        self.tiers
            .iter()
            .find(|t| t.kind() == kind)
            .map_or(0, |t| t.len())
    }

    fn tier_bytes(&self, kind: TierKind) -> u64 {
        self.tiers
            .iter()
            .find(|t| t.kind() == kind)
            .map_or(0, |t| t.size_bytes())
    }

    /// Statistics counters merged with current tier sizes
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            size: self.size(),
            in_memory_size: self.in_memory_size(),
            off_heap_size: self.off_heap_size(),
            on_disk_size: self.on_disk_size(),
            in_memory_size_bytes: self.in_memory_size_bytes(),
            off_heap_size_bytes: self.off_heap_size_bytes(),
            on_disk_size_bytes: self.on_disk_size_bytes(),
            ..self.statistics.snapshot()
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Sweep every tier for TTL/TTI-expired elements
    #[instrument(skip(self), fields(cache = %self.name))]
    pub fn expire_elements(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut events = Vec::new();
        let mut expired = 0;

        for tier in &self.tiers {
            let candidates = tier.sample(0, usize::MAX, &|c| c.is_expired(now));
            for candidate in candidates {
                let _guard = self.lock_stripe(&candidate.key);
                let still_expired = tier
                    .get(&candidate.key)?
                    .is_some_and(|e| e.is_expired(now));
                if still_expired {
                    tier.remove(&candidate.key)?;
                    self.statistics.record_expiration();
                    events.push(CacheEvent::expired(&self.name, candidate.key.as_str()));
                    expired += 1;
                }
            }
        }

        self.listeners.dispatch_all(&events);
        if expired > 0 {
            debug!(expired, "Expired elements");
        }
        Ok(expired)
    }

    /// Evict until every bounded tier is within capacity
    pub fn enforce_capacity(&self) -> Result<()> {
        let mut events = Vec::new();
        let mut held = Vec::new();
        for idx in 0..self.tiers.len() {
            self.enforce(idx, None, &mut held, &mut events)?;
        }
        self.listeners.dispatch_all(&events);
        Ok(())
    }

    // =========================================================================
    // Internals (stripe lock held by caller unless noted)
    // =========================================================================

    #[inline]
    fn stripe_index(&self, key: &CacheKey) -> usize {
        key.shard_index(STRIPE_COUNT)
    }

    fn lock_stripe(&self, key: &CacheKey) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_index(key)].lock()
    }

    #[inline]
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Live resident element and its tier; an expired one is removed
    fn current(
        &self,
        key: &CacheKey,
        now: u64,
        events: &mut Vec<CacheEvent>,
    ) -> Result<Option<(usize, Element)>> {
        for (idx, tier) in self.tiers.iter().enumerate() {
            if let Some(element) = tier.get(key)? {
                if element.is_expired(now) {
                    tier.remove(key)?;
                    self.statistics.record_expiration();
                    events.push(CacheEvent::expired(&self.name, key.as_str()));
                    return Ok(None);
                }
                return Ok(Some((idx, element)));
            }
        }
        Ok(None)
    }

    /// Remove and return the live resident element
    fn take_current(
        &self,
        key: &CacheKey,
        now: u64,
        events: &mut Vec<CacheEvent>,
    ) -> Result<Option<Element>> {
        match self.current(key, now, events)? {
            Some((idx, _)) => self.tiers[idx].remove(key),
            None => Ok(None),
        }
    }

    /// Stamp and place `element` in the heap tier
    fn install(&self, mut element: Element, previous: Option<&Element>, now: u64) -> Result<Element> {
        element.apply_default_lifespan(
            self.lifespan.time_to_live,
            self.lifespan.time_to_idle,
            self.lifespan.eternal,
        );
        if self.pin_all {
            element = element.pinned();
        }
        let tick = self.next_tick();
        match previous {
            Some(previous) => element.stamp_update(previous, now, tick),
            None => element.stamp_insert(now, tick),
        }
        self.tiers[0].put(element.clone())?;
        Ok(element)
    }

    fn record_write(
        &self,
        installed: &Element,
        previous: Option<&Element>,
        events: &mut Vec<CacheEvent>,
    ) {
        if installed.is_soft_locked() || previous.is_some_and(|p| p.is_soft_locked()) {
            return;
        }
        match previous {
            Some(previous) => {
                self.statistics.record_update();
                events.push(CacheEvent::updated(
                    &self.name,
                    installed.key().as_str(),
                    previous.version(),
                    installed.version(),
                ));
            }
            None => {
                self.statistics.record_put();
                events.push(CacheEvent::put(
                    &self.name,
                    installed.key().as_str(),
                    installed.version(),
                ));
            }
        }
    }

    fn record_remove(&self, removed: &Element, events: &mut Vec<CacheEvent>) {
        if removed.is_soft_locked() {
            return;
        }
        self.statistics.record_remove();
        events.push(CacheEvent::removed(&self.name, removed.key().as_str()));
    }

    fn after_write(
        &self,
        key: &CacheKey,
        stripe: usize,
        events: &mut Vec<CacheEvent>,
    ) -> Result<()> {
        match self.evictor.get() {
            Some(evictor) => {
                if self.tiers[0].is_over_capacity() {
                    evictor.signal();
                }
                Ok(())
            }
            None => self.enforce(0, Some(key), &mut vec![stripe], events),
        }
    }

    fn lookup(
        &self,
        key: &CacheKey,
        stripe: usize,
        events: &mut Vec<CacheEvent>,
    ) -> Result<Option<Element>> {
        let now = self.clock.now_millis();
        for (idx, tier) in self.tiers.iter().enumerate() {
            let Some(element) = tier.get(key)? else {
                continue;
            };

            if element.is_expired(now) {
                tier.remove(key)?;
                self.statistics.record_expired_miss();
                self.statistics.record_expiration();
                events.push(CacheEvent::expired(&self.name, key.as_str()));
                return Ok(None);
            }

            self.statistics.record_hit(tier.kind());
            let tick = self.next_tick();
            if idx == 0 {
                return tier.touch(key, now, tick);
            }

            // Promote: the stripe lock covers the whole move
            let mut element = tier.remove(key)?.unwrap_or(element);
            element.record_access(now, tick);
            self.tiers[0].put(element.clone())?;
            self.statistics.record_promotion();
            trace!(cache = %self.name, %key, from = %tier.kind(), "Promoted element");
            self.enforce(0, Some(key), &mut vec![stripe], events)?;
            return Ok(Some(element));
        }

        self.statistics.record_miss();
        Ok(None)
    }

    /// Evict from tier `idx` until within bounds; `held` lists stripes
    /// already locked by this call chain.
    fn enforce(
        &self,
        idx: usize,
        protect: Option<&CacheKey>,
        held: &mut Vec<usize>,
        events: &mut Vec<CacheEvent>,
    ) -> Result<()> {
        let tier = &self.tiers[idx];
        let mut stalls = 0;
        while tier.is_over_capacity() {
            if self.evict_one(idx, protect, held, events)? {
                stalls = 0;
            } else {
                stalls += 1;
                if stalls >= MAX_EVICTION_STALLS {
                    trace!(
                        cache = %self.name,
                        tier = %tier.kind(),
                        entries = tier.len(),
                        "No evictable candidates, tier left over capacity"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    fn evict_one(
        &self,
        idx: usize,
        protect: Option<&CacheKey>,
        held: &mut Vec<usize>,
        events: &mut Vec<CacheEvent>,
    ) -> Result<bool> {
        let tier = &self.tiers[idx];
        let now = self.clock.now_millis();
        let limit = sample_size(tier.evictable_len()).max(1);
        let start = if self.policy.sweeps() {
            self.hands[idx].load(Ordering::Relaxed)
        } else {
            rand::thread_rng().gen_range(0..tier.shard_count())
        };

        let filter = |c: &Candidate| !c.pinned && protect != Some(&c.key);
        let candidates = tier.sample(start, limit, &filter);
        let victim = candidates
            .iter()
            .position(|c| c.is_expired(now))
            .or_else(|| self.policy.select_victim(&candidates));
        let Some(victim) = victim else {
            return Ok(false);
        };

        if self.policy.sweeps() {
            for passed in &candidates[..victim] {
                tier.clear_reference(&passed.key);
            }
            self.hands[idx].store(
                candidates[victim].key.shard_index(tier.shard_count()),
                Ordering::Relaxed,
            );
        }

        let key = &candidates[victim].key;
        let stripe = self.stripe_index(key);
        let _guard = if held.contains(&stripe) {
            None
        } else {
            match self.stripes[stripe].try_lock() {
                Some(guard) => Some(guard),
                None => {
                    trace!(cache = %self.name, %key, "Skipping contended eviction candidate");
                    return Ok(false);
                }
            }
        };

        let Some(element) = tier.remove(key)? else {
            return Ok(false);
        };
        if element.is_pinned() {
            tier.put(element)?;
            return Ok(false);
        }
        if element.is_expired(now) {
            self.statistics.record_expiration();
            events.push(CacheEvent::expired(&self.name, key.as_str()));
            return Ok(true);
        }

        held.push(stripe);
        let result = self.demote_or_drop(idx, element, held, events);
        held.pop();
        result.map(|()| true)
    }

    fn demote_or_drop(
        &self,
        idx: usize,
        element: Element,
        held: &mut Vec<usize>,
        events: &mut Vec<CacheEvent>,
    ) -> Result<()> {
        let tier = &self.tiers[idx];
        match self.tiers.get(idx + 1) {
            Some(next) => {
                if let Err(e) = next.put(element.clone()) {
                    warn!(cache = %self.name, key = %element.key(), error = %e, "Demotion failed");
                    tier.put(element)?;
                    return Err(e);
                }
                self.statistics.record_demotion();
                trace!(
                    cache = %self.name,
                    key = %element.key(),
                    from = %tier.kind(),
                    to = %next.kind(),
                    "Demoted element"
                );
                self.enforce(idx + 1, None, held, events)
            }
            None => {
                self.statistics.record_eviction();
                trace!(cache = %self.name, key = %element.key(), tier = %tier.kind(), "Evicted element");
                events.push(CacheEvent::evicted(
                    &self.name,
                    element.key().as_str(),
                    tier.kind(),
                ));
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("name", &self.name)
            .field("tiers", &self.tier_kinds())
            .field("policy", &self.policy_kind)
            .field("size", &self.size())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
