//! Soft Lock Manager
//!
//! Concurrent registry of live soft locks for one cache, keyed by
//! (transaction, key).

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::context::{TransactionContext, TransactionId};
use super::soft_lock::{SoftLock, SoftLockId};
use crate::error::Result;
use crate::store::element::{CacheKey, Element};
use crate::store::TieredStore;

/// Registry of soft locks held on one cache
#[derive(Debug, Default)]
pub struct SoftLockManager {
    locks: DashMap<(TransactionId, CacheKey), Arc<SoftLock>>,
}

impl SoftLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a soft lock id, creating the lock on first use per (tx, key)
    ///
    /// # Panics
    ///
    /// If either image is itself a soft-lock shadow.
    pub fn create_soft_lock_id(
        &self,
        transaction_id: TransactionId,
        key: CacheKey,
        new_element: Option<Element>,
        old_element: Option<Element>,
    ) -> Arc<SoftLockId> {
        assert!(
            !new_element.as_ref().is_some_and(Element::is_soft_locked),
            "new element for key {} is already soft locked",
            key
        );
        assert!(
            !old_element.as_ref().is_some_and(Element::is_soft_locked),
            "old element for key {} is already soft locked",
            key
        );

        self.locks
            .entry((transaction_id, key.clone()))
            .or_insert_with(|| {
                trace!(transaction = %transaction_id, %key, "Created soft lock");
                Arc::new(SoftLock::new(transaction_id, key.clone()))
            });

        Arc::new(SoftLockId::new(transaction_id, key, new_element, old_element))
    }

    pub fn find_soft_lock_by_id(&self, id: &SoftLockId) -> Option<Arc<SoftLock>> {
        self.locks
            .get(&(*id.transaction_id(), id.key().clone()))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn collect_all_soft_locks_for_transaction_id(
        &self,
        transaction_id: &TransactionId,
    ) -> Vec<Arc<SoftLock>> {
        self.locks
            .iter()
            .filter(|entry| entry.key().0 == *transaction_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Distinct transactions holding at least one lock
    pub fn transaction_ids(&self) -> HashSet<TransactionId> {
        self.locks.iter().map(|entry| entry.key().0).collect()
    }

    /// Keys whose value resolves to nothing from `context`'s point of view
    pub fn get_keys_invisible_in_context(
        &self,
        context: Option<&TransactionContext>,
        store: &TieredStore,
    ) -> Result<HashSet<CacheKey>> {
        let current = context.map(TransactionContext::id);
        let locks: Vec<Arc<SoftLock>> = self.locks.iter().map(|e| Arc::clone(e.value())).collect();

        let mut invisible = HashSet::new();
        for lock in locks {
            let Some(element) = store.get_quiet(lock.key())? else {
                continue;
            };
            let Some(id) = element.soft_lock_id() else {
                continue;
            };
            if id.transaction_id() != lock.transaction_id() {
                continue;
            }
            if lock.get_element(current, id).is_none() {
                invisible.insert(lock.key().clone());
            }
        }
        Ok(invisible)
    }

    /// Remove `lock` if it is still registered; safe to call repeatedly
    pub fn clear_soft_lock(&self, lock: &SoftLock) {
        let removed = self
            .locks
            .remove_if(&(*lock.transaction_id(), lock.key().clone()), |_, registered| {
                std::ptr::eq(registered.as_ref(), lock)
            });
        if removed.is_some() {
            trace!(transaction = %lock.transaction_id(), key = %lock.key(), "Cleared soft lock");
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_reuses_lock_per_transaction_and_key() {
        let manager = SoftLockManager::new();
        let tx = TransactionId::new();
        let key = CacheKey::new("k");

        let first = manager.create_soft_lock_id(tx, key.clone(), Some(Element::new("k", "1")), None);
        let second = manager.create_soft_lock_id(tx, key.clone(), Some(Element::new("k", "2")), None);

        let a = manager.find_soft_lock_by_id(&first).unwrap();
        let b = manager.find_soft_lock_by_id(&second).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len(), 1);

        manager.create_soft_lock_id(TransactionId::new(), key, None, None);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_collect_and_clear() {
        let manager = SoftLockManager::new();
        let tx = TransactionId::new();
        for k in ["a", "b", "c"] {
            manager.create_soft_lock_id(tx, CacheKey::new(k), None, None);
        }
        manager.create_soft_lock_id(TransactionId::new(), CacheKey::new("a"), None, None);

        let locks = manager.collect_all_soft_locks_for_transaction_id(&tx);
        assert_eq!(locks.len(), 3);

        for lock in &locks {
            manager.clear_soft_lock(lock);
            manager.clear_soft_lock(lock);
        }
        assert!(manager.collect_all_soft_locks_for_transaction_id(&tx).is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_clear_ignores_replaced_lock() {
        let manager = SoftLockManager::new();
        let tx = TransactionId::new();
        let key = CacheKey::new("k");
        let id = manager.create_soft_lock_id(tx, key.clone(), None, None);
        let stale = manager.find_soft_lock_by_id(&id).unwrap();

        manager.clear_soft_lock(&stale);
        let id = manager.create_soft_lock_id(tx, key, None, None);
        let fresh = manager.find_soft_lock_by_id(&id).unwrap();

        manager.clear_soft_lock(&stale);
        assert!(manager.find_soft_lock_by_id(&id).is_some());
        manager.clear_soft_lock(&fresh);
        assert!(manager.is_empty());
    }

    #[test]
    #[should_panic(expected = "already soft locked")]
    fn test_wrapping_a_shadow_panics() {
        let manager = SoftLockManager::new();
        let tx = TransactionId::new();
        let key = CacheKey::new("k");
        let id = manager.create_soft_lock_id(tx, key.clone(), None, None);
        let shadow = Element::soft_locked(key.clone(), id);
        manager.create_soft_lock_id(tx, key, Some(shadow), None);
    }
}
