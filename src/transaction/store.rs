//! Local Transaction Store
//!
//! Read-committed transactional view over a [`TieredStore`]. Every write
//! installs a soft-lock shadow through a compare-and-swap on the underlying
//! store and retries until it wins or the transaction times out.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use tracing::{debug, instrument, trace};

use super::context::{TransactionContext, TransactionId, TransactionParticipant};
use super::controller::TransactionController;
use super::manager::SoftLockManager;
use super::soft_lock::{SoftLock, SoftLockId};
use crate::error::{Error, Result};
use crate::event::CacheEvent;
use crate::store::element::{
    CacheKey, DefaultElementValueComparator, Element, ElementValueComparator,
};
use crate::store::TieredStore;

/// Transactional store that participates in local transactions
pub struct LocalTransactionStore {
    store: Arc<TieredStore>,
    soft_locks: SoftLockManager,
    controller: Arc<TransactionController>,
    comparator: Arc<dyn ElementValueComparator>,
}

impl LocalTransactionStore {
    /// Wrap `store` and register it with `controller` for recovery
    pub fn new(store: Arc<TieredStore>, controller: Arc<TransactionController>) -> Arc<Self> {
        let this = Arc::new(Self {
            store,
            soft_locks: SoftLockManager::new(),
            controller: Arc::clone(&controller),
            comparator: Arc::new(DefaultElementValueComparator),
        });
        let weak: Weak<LocalTransactionStore> = Arc::downgrade(&this);
        controller.register_participant(weak);
        this
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn underlying(&self) -> &Arc<TieredStore> {
        &self.store
    }

    pub fn soft_locks(&self) -> &SoftLockManager {
        &self.soft_locks
    }

    // =========================================================================
    // Transactional Operations
    // =========================================================================

    /// Write `element` under `context`; `true` when the key was absent
    #[instrument(skip(self, context, element), fields(cache = %self.name(), key = %element.key()))]
    pub fn put(self: &Arc<Self>, context: &TransactionContext, element: Element) -> Result<bool> {
        let key = element.key().clone();
        let tx = *context.id();
        loop {
            context.ensure_usable()?;
            match self.store.get_quiet(&key)? {
                None => {
                    if self.try_insert(context, &key, Some(element.clone()))? {
                        return Ok(true);
                    }
                }
                Some(current) => match current.soft_lock_id().cloned() {
                    Some(id) if self.cleanup_expired_soft_lock(&id)? => {}
                    Some(id) if *id.transaction_id() == tx => {
                        let was_invisible = id.new_element().is_none();
                        let next = self.soft_locks.create_soft_lock_id(
                            tx,
                            key.clone(),
                            Some(element.clone()),
                            id.old_element().cloned(),
                        );
                        if self.swap_shadow(&current, &next)? {
                            return Ok(was_invisible);
                        }
                    }
                    Some(id) => self.wait_for_foreign(context, &id)?,
                    None => {
                        if self.try_shadow(context, &current, Some(element.clone()))? {
                            return Ok(false);
                        }
                    }
                },
            }
        }
    }

    /// Read through `context`: own writes are visible, foreign ones are not
    pub fn get(&self, context: &TransactionContext, key: &CacheKey) -> Result<Option<Element>> {
        context.ensure_usable()?;
        self.resolve(Some(context.id()), key, true)
    }

    /// As [`get`](Self::get) without touching statistics or access metadata
    pub fn get_quiet(&self, context: &TransactionContext, key: &CacheKey) -> Result<Option<Element>> {
        context.ensure_usable()?;
        self.resolve(Some(context.id()), key, false)
    }

    /// Committed value of `key` as seen from outside any transaction
    pub fn read_committed(&self, key: &CacheKey) -> Result<Option<Element>> {
        self.resolve(None, key, true)
    }

    /// Remove `key` under `context`; returns the value visible before
    #[instrument(skip(self, context), fields(cache = %self.name(), %key))]
    pub fn remove(
        self: &Arc<Self>,
        context: &TransactionContext,
        key: &CacheKey,
    ) -> Result<Option<Element>> {
        let tx = *context.id();
        loop {
            context.ensure_usable()?;
            let Some(current) = self.store.get_quiet(key)? else {
                return Ok(None);
            };
            match current.soft_lock_id().cloned() {
                Some(id) if self.cleanup_expired_soft_lock(&id)? => {}
                Some(id) if *id.transaction_id() == tx => {
                    let previous = id.new_element().cloned();
                    let next = self.soft_locks.create_soft_lock_id(
                        tx,
                        key.clone(),
                        None,
                        id.old_element().cloned(),
                    );
                    if self.swap_shadow(&current, &next)? {
                        return Ok(previous);
                    }
                }
                Some(id) => self.wait_for_foreign(context, &id)?,
                None => {
                    if self.try_shadow(context, &current, None)? {
                        return Ok(Some(current));
                    }
                }
            }
        }
    }

    /// Write unless a value is visible to `context`; returns the visible value
    pub fn put_if_absent(
        self: &Arc<Self>,
        context: &TransactionContext,
        element: Element,
    ) -> Result<Option<Element>> {
        let key = element.key().clone();
        let tx = *context.id();
        loop {
            context.ensure_usable()?;
            match self.store.get_quiet(&key)? {
                None => {
                    if self.try_insert(context, &key, Some(element.clone()))? {
                        return Ok(None);
                    }
                }
                Some(current) => match current.soft_lock_id().cloned() {
                    Some(id) if self.cleanup_expired_soft_lock(&id)? => {}
                    Some(id) if *id.transaction_id() == tx => {
                        if let Some(visible) = id.new_element() {
                            return Ok(Some(visible.clone()));
                        }
                        let next = self.soft_locks.create_soft_lock_id(
                            tx,
                            key.clone(),
                            Some(element.clone()),
                            id.old_element().cloned(),
                        );
                        if self.swap_shadow(&current, &next)? {
                            return Ok(None);
                        }
                    }
                    Some(id) => self.wait_for_foreign(context, &id)?,
                    None => return Ok(Some(current)),
                },
            }
        }
    }

    /// Remove only if the value visible to `context` equals `element`
    pub fn remove_element(
        self: &Arc<Self>,
        context: &TransactionContext,
        element: &Element,
    ) -> Result<Option<Element>> {
        let key = element.key().clone();
        let tx = *context.id();
        loop {
            context.ensure_usable()?;
            let Some(current) = self.store.get_quiet(&key)? else {
                return Ok(None);
            };
            match current.soft_lock_id().cloned() {
                Some(id) if self.cleanup_expired_soft_lock(&id)? => {}
                Some(id) if *id.transaction_id() == tx => {
                    let Some(visible) = id.new_element().cloned() else {
                        return Ok(None);
                    };
                    if !self.comparator.equals(&visible, element) {
                        return Ok(None);
                    }
                    let next = self.soft_locks.create_soft_lock_id(
                        tx,
                        key.clone(),
                        None,
                        id.old_element().cloned(),
                    );
                    if self.swap_shadow(&current, &next)? {
                        return Ok(Some(visible));
                    }
                }
                Some(id) => self.wait_for_foreign(context, &id)?,
                None => {
                    if !self.comparator.equals(&current, element) {
                        return Ok(None);
                    }
                    if self.try_shadow(context, &current, None)? {
                        return Ok(Some(current));
                    }
                }
            }
        }
    }

    /// Keys visible to `context`
    pub fn get_keys(&self, context: &TransactionContext) -> Result<Vec<CacheKey>> {
        context.ensure_usable()?;
        let invisible = self.invisible_keys(Some(context))?;
        Ok(self
            .store
            .keys()
            .into_iter()
            .filter(|k| !invisible.contains(k))
            .collect())
    }

    /// Number of keys visible to `context`
    pub fn get_size(&self, context: &TransactionContext) -> Result<usize> {
        context.ensure_usable()?;
        let invisible = self.invisible_keys(Some(context))?;
        Ok(self.store.size().saturating_sub(invisible.len()))
    }

    pub fn contains_key(&self, context: &TransactionContext, key: &CacheKey) -> Result<bool> {
        Ok(self.get_keys(context)?.contains(key))
    }

    /// Remove every key visible to `context`
    pub fn remove_all(self: &Arc<Self>, context: &TransactionContext) -> Result<usize> {
        let mut removed = 0;
        for key in self.get_keys(context)? {
            if self.remove(context, &key)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Keys visible outside any transaction
    pub fn committed_keys(&self) -> Result<Vec<CacheKey>> {
        let invisible = self.invisible_keys(None)?;
        Ok(self
            .store
            .keys()
            .into_iter()
            .filter(|k| !invisible.contains(k))
            .collect())
    }

    /// Number of keys visible outside any transaction
    pub fn committed_size(&self) -> Result<usize> {
        let invisible = self.invisible_keys(None)?;
        Ok(self.store.size().saturating_sub(invisible.len()))
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn invisible_keys(&self, context: Option<&TransactionContext>) -> Result<HashSet<CacheKey>> {
        self.soft_locks
            .get_keys_invisible_in_context(context, &self.store)
    }

    fn shadow(id: &Arc<SoftLockId>) -> Element {
        Element::soft_locked(id.key().clone(), Arc::clone(id)).eternal()
    }

    fn lock_for(&self, id: &SoftLockId) -> Result<Arc<SoftLock>> {
        self.soft_locks
            .find_soft_lock_by_id(id)
            .ok_or_else(|| Error::Internal(format!("soft lock for key {} vanished", id.key())))
    }

    fn enlist(self: &Arc<Self>, context: &TransactionContext) {
        let participant: Arc<dyn TransactionParticipant> = self.clone();
        context.register(participant);
    }

    /// Claim an absent key with a fresh shadow
    fn try_insert(
        self: &Arc<Self>,
        context: &TransactionContext,
        key: &CacheKey,
        new_element: Option<Element>,
    ) -> Result<bool> {
        let id = self
            .soft_locks
            .create_soft_lock_id(*context.id(), key.clone(), new_element, None);
        let lock = self.lock_for(&id)?;
        lock.lock();
        if self.store.put_if_absent(Self::shadow(&id))?.is_none() {
            self.enlist(context);
            return Ok(true);
        }
        lock.unlock();
        Ok(false)
    }

    /// Replace a plain value with a shadow carrying it as the old image
    fn try_shadow(
        self: &Arc<Self>,
        context: &TransactionContext,
        current: &Element,
        new_element: Option<Element>,
    ) -> Result<bool> {
        let id = self.soft_locks.create_soft_lock_id(
            *context.id(),
            current.key().clone(),
            new_element,
            Some(current.clone()),
        );
        let lock = self.lock_for(&id)?;
        lock.lock();
        if self
            .store
            .replace_element(current, Self::shadow(&id), self.comparator.as_ref())?
        {
            self.enlist(context);
            return Ok(true);
        }
        lock.unlock();
        Ok(false)
    }

    /// Replace this transaction's shadow with a newer one
    fn swap_shadow(&self, current: &Element, next: &Arc<SoftLockId>) -> Result<bool> {
        self.store
            .replace_element(current, Self::shadow(next), self.comparator.as_ref())
    }

    fn wait_for_foreign(&self, context: &TransactionContext, id: &SoftLockId) -> Result<()> {
        let Some(lock) = self.soft_locks.find_soft_lock_by_id(id) else {
            return Ok(());
        };
        trace!(key = %id.key(), foreign = %id.transaction_id(), "Waiting on foreign soft lock");
        if lock.wait_released(context.time_before_timeout()) {
            return Ok(());
        }
        if context.has_locked_anything() {
            return Err(Error::Deadlock {
                key: id.key().to_string(),
                current: context.id().to_string(),
                foreign: id.transaction_id().to_string(),
            });
        }
        Ok(())
    }

    fn resolve(
        &self,
        current: Option<&TransactionId>,
        key: &CacheKey,
        observable: bool,
    ) -> Result<Option<Element>> {
        loop {
            let found = if observable {
                self.store.get(key)?
            } else {
                self.store.get_quiet(key)?
            };
            let Some(element) = found else {
                return Ok(None);
            };
            let Some(id) = element.soft_lock_id().cloned() else {
                return Ok(Some(element));
            };
            if self.cleanup_expired_soft_lock(&id)? {
                continue;
            }
            match self.soft_locks.find_soft_lock_by_id(&id) {
                Some(lock) => return Ok(lock.get_element(current, &id)),
                None => self.resolve_orphan(&element, &id)?,
            }
        }
    }

    /// Finalize a shadow whose lock is no longer registered
    fn resolve_orphan(&self, shadow: &Element, id: &SoftLockId) -> Result<()> {
        let commit = self.controller.is_decision_commit(id.transaction_id());
        let target = if commit { id.new_element() } else { id.old_element() };
        debug!(key = %id.key(), commit, "Resolving orphaned shadow");
        match target {
            Some(element) => {
                self.store
                    .replace_element(shadow, element.clone(), self.comparator.as_ref())?;
            }
            None => {
                self.store.remove_element(shadow, self.comparator.as_ref())?;
            }
        }
        Ok(())
    }

    /// Finish the work of an expired transaction on one key
    ///
    /// Returns `true` when the lock was expired and has been resolved, in
    /// which case the caller must re-read the key.
    fn cleanup_expired_soft_lock(&self, id: &SoftLockId) -> Result<bool> {
        let Some(lock) = self.soft_locks.find_soft_lock_by_id(id) else {
            return Ok(false);
        };
        if !self.controller.is_expired(id.transaction_id()) {
            return Ok(false);
        }
        let _frozen = lock.freeze();
        let commit = self.controller.is_decision_commit(id.transaction_id());
        debug!(key = %id.key(), transaction = %id.transaction_id(), commit, "Cleaning up expired soft lock");
        self.finalize_lock(&lock, commit)?;
        Ok(true)
    }

    /// Apply the decision for one lock, then release it
    fn finalize_lock(&self, lock: &SoftLock, commit: bool) -> Result<bool> {
        let mut applied = false;
        if let Some(current) = self.store.get_quiet(lock.key())? {
            let owned = current
                .soft_lock_id()
                .filter(|id| id.transaction_id() == lock.transaction_id())
                .cloned();
            if let Some(id) = owned {
                let target = if commit { id.new_element() } else { id.old_element() };
                applied = match target {
                    Some(element) => self.store.replace_element(
                        &current,
                        element.clone(),
                        self.comparator.as_ref(),
                    )?,
                    None => self
                        .store
                        .remove_element(&current, self.comparator.as_ref())?
                        .is_some(),
                };
                if applied && commit {
                    self.publish(&id)?;
                }
            }
        }
        self.soft_locks.clear_soft_lock(lock);
        lock.unlock();
        Ok(applied)
    }

    /// Statistics and events for one committed key
    fn publish(&self, id: &SoftLockId) -> Result<()> {
        let name = self.store.name();
        let key = id.key().as_str();
        let statistics = self.store.statistics();
        let event = match (id.old_element(), id.new_element()) {
            (None, Some(_)) => {
                statistics.record_put();
                let version = self.installed_version(id.key())?;
                CacheEvent::put(name, key, version)
            }
            (Some(old), Some(_)) => {
                statistics.record_update();
                let version = self.installed_version(id.key())?;
                CacheEvent::updated(name, key, old.version(), version)
            }
            (Some(_), None) => {
                statistics.record_remove();
                CacheEvent::removed(name, key)
            }
            (None, None) => return Ok(()),
        };
        self.store.listeners().dispatch(&event);
        Ok(())
    }

    fn installed_version(&self, key: &CacheKey) -> Result<u64> {
        Ok(self.store.get_quiet(key)?.map_or(1, |e| e.version()))
    }

    fn finalize_all(&self, transaction: &TransactionId, commit: bool) -> Result<usize> {
        let mut finalized = 0;
        for lock in self
            .soft_locks
            .collect_all_soft_locks_for_transaction_id(transaction)
        {
            let _frozen = lock.freeze();
            if self.finalize_lock(&lock, commit)? {
                finalized += 1;
            }
        }
        Ok(finalized)
    }
}

impl TransactionParticipant for LocalTransactionStore {
    fn participant_name(&self) -> &str {
        self.store.name()
    }

    fn commit(&self, transaction: &TransactionId) -> Result<usize> {
        let finalized = self.finalize_all(transaction, true)?;
        debug!(cache = %self.name(), %transaction, finalized, "Committed soft locks");
        Ok(finalized)
    }

    fn rollback(&self, transaction: &TransactionId) -> Result<usize> {
        let finalized = self.finalize_all(transaction, false)?;
        debug!(cache = %self.name(), %transaction, finalized, "Rolled back soft locks");
        Ok(finalized)
    }

    fn recover(&self) -> Result<Vec<TransactionId>> {
        let mut recovered = Vec::new();
        for transaction in self.soft_locks.transaction_ids() {
            if !self.controller.is_expired(&transaction) {
                continue;
            }
            let commit = self.controller.is_decision_commit(&transaction);
            self.finalize_all(&transaction, commit)?;
            recovered.push(transaction);
        }
        Ok(recovered)
    }
}

impl std::fmt::Debug for LocalTransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransactionStore")
            .field("name", &self.name())
            .field("soft_locks", &self.soft_locks.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
