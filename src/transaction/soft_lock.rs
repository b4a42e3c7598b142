//! Soft Locks
//!
//! A soft lock shadows one key for one transaction. The store holds an
//! element whose value is a [`SoftLockId`] carrying the before and after
//! images; the [`SoftLock`] itself tracks whether the owning transaction is
//! still holding the key.

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::context::TransactionId;
use crate::store::element::{CacheKey, Element};

/// Token stored in place of a transactionally modified value
///
/// Two ids are equal when they belong to the same transaction and key,
/// whatever images they carry.
#[derive(Debug, Clone)]
pub struct SoftLockId {
    transaction_id: TransactionId,
    key: CacheKey,
    new_element: Option<Element>,
    old_element: Option<Element>,
}

impl SoftLockId {
    pub fn new(
        transaction_id: TransactionId,
        key: CacheKey,
        new_element: Option<Element>,
        old_element: Option<Element>,
    ) -> Self {
        Self {
            transaction_id,
            key,
            new_element,
            old_element,
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Value the transaction will publish (`None` for a removal)
    pub fn new_element(&self) -> Option<&Element> {
        self.new_element.as_ref()
    }

    /// Value visible to everyone else until the transaction finishes
    pub fn old_element(&self) -> Option<&Element> {
        self.old_element.as_ref()
    }
}

impl PartialEq for SoftLockId {
    fn eq(&self, other: &Self) -> bool {
        self.transaction_id == other.transaction_id && self.key == other.key
    }
}

impl Eq for SoftLockId {}

impl Hash for SoftLockId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transaction_id.hash(state);
        self.key.hash(state);
    }
}

/// Per-(transaction, key) lock
#[derive(Debug)]
pub struct SoftLock {
    transaction_id: TransactionId,
    key: CacheKey,
    locked: Mutex<bool>,
    released: Condvar,
    finalizer: Mutex<()>,
}

impl SoftLock {
    pub(crate) fn new(transaction_id: TransactionId, key: CacheKey) -> Self {
        Self {
            transaction_id,
            key,
            locked: Mutex::new(false),
            released: Condvar::new(),
            finalizer: Mutex::new(()),
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Mark the key as held by the owning transaction
    pub fn lock(&self) {
        *self.locked.lock() = true;
    }

    /// Release the key and wake every waiting writer
    pub fn unlock(&self) {
        *self.locked.lock() = false;
        self.released.notify_all();
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    /// Block until the owner releases the key; `false` on timeout
    pub fn wait_released(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut locked = self.locked.lock();
        while *locked {
            if self.released.wait_until(&mut locked, deadline).timed_out() {
                return !*locked;
            }
        }
        true
    }

    /// Exclusive right to finalize this lock (commit, rollback or cleanup)
    pub fn freeze(&self) -> MutexGuard<'_, ()> {
        self.finalizer.lock()
    }

    /// Image visible to `current` for the value guarded by `id`
    pub fn get_element(&self, current: Option<&TransactionId>, id: &SoftLockId) -> Option<Element> {
        if current == Some(&id.transaction_id) {
            id.new_element.clone()
        } else {
            id.old_element.clone()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
