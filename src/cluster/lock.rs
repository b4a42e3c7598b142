//! Lock Context
//!
//! Explicit per-caller record of held cluster key locks. Clones share the
//! same holds, so a context can be handed to spawned tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::store::element::CacheKey;

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Outcome of releasing one local hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRelease {
    /// The context never held the lock
    NotHeld,
    /// Re-entrant holds remain
    StillHeld(u32),
    /// Last hold gone; the cluster lock must be released
    Released,
}

#[derive(Debug)]
struct Holds {
    holder: u64,
    counts: Mutex<HashMap<(String, CacheKey), u32>>,
}

/// Lock stack of one logical caller
#[derive(Debug, Clone)]
pub struct LockContext {
    inner: Arc<Holds>,
}

impl LockContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Holds {
                holder: NEXT_HOLDER.fetch_add(1, Ordering::Relaxed),
                counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Holder id presented to the cluster
    pub fn holder(&self) -> u64 {
        self.inner.holder
    }

    pub fn hold_count(&self, cache: &str, key: &CacheKey) -> u32 {
        self.inner
            .counts
            .lock()
            .get(&(cache.to_string(), key.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Total holds across all keys
    pub fn total_holds(&self) -> u32 {
        self.inner.counts.lock().values().sum()
    }

    /// Add a hold if one already exists; `false` means a cluster call is needed
    pub(crate) fn reenter(&self, cache: &str, key: &CacheKey) -> bool {
        let mut counts = self.inner.counts.lock();
        match counts.get_mut(&(cache.to_string(), key.clone())) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    /// Record a freshly acquired cluster lock
    pub(crate) fn acquired(&self, cache: &str, key: &CacheKey) {
        *self
            .inner
            .counts
            .lock()
            .entry((cache.to_string(), key.clone()))
            .or_insert(0) += 1;
    }

    /// Drop one local hold
    pub(crate) fn release(&self, cache: &str, key: &CacheKey) -> LockRelease {
        let mut counts = self.inner.counts.lock();
        let entry = (cache.to_string(), key.clone());
        let remaining = match counts.get_mut(&entry) {
            None => return LockRelease::NotHeld,
            Some(count) => {
                *count -= 1;
                *count
            }
        };
        if remaining > 0 {
            return LockRelease::StillHeld(remaining);
        }
        counts.remove(&entry);
        LockRelease::Released
    }
}

impl Default for LockContext {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Lock Claim
// =============================================================================

const CLAIM_PENDING: u8 = 0;
const CLAIM_COMPLETED: u8 = 1;
const CLAIM_ABANDONED: u8 = 2;

/// Hand-off between a lock request and the caller awaiting it
///
/// Exactly one side wins: the request completes and the caller keeps the
/// hold, or the caller abandons first and the request gives the lock back
/// when it lands.
#[derive(Debug, Clone, Default)]
pub(crate) struct LockClaim {
    state: Arc<AtomicU8>,
}

impl LockClaim {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Request side; `false` if the caller already gave up
    pub(crate) fn complete(&self) -> bool {
        self.state
            .compare_exchange(CLAIM_PENDING, CLAIM_COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Caller side; `false` if the request completed first
    pub(crate) fn abandon(&self) -> bool {
        self.state
            .compare_exchange(CLAIM_PENDING, CLAIM_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// =============================================================================
// Tests
// =============================================================================
