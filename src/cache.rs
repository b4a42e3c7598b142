//! Caches
//!
//! [`Cache`] is a node-local cache over a [`TieredStore`], optionally
//! transactional. [`ClusteredCache`] fronts a coherent clustered store
//! through the nonstop layer.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cluster::{CoherentClusteredStore, LockContext};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::event::CacheEventListener;
use crate::nonstop::NonstopStore;
use crate::statistics::StatisticsSnapshot;
use crate::store::element::{CacheKey, Element};
use crate::store::{Clock, TieredStore};
use crate::transaction::{LocalTransactionStore, TransactionController};

/// Build the tiers described by `config`
pub(crate) fn build_store(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Arc<TieredStore>> {
    let mut builder = TieredStore::builder(config.name.clone())
        .heap(config.tiers.heap)
        .eviction_policy(config.eviction_policy_kind()?)
        .eviction_mode(config.eviction_mode)
        .lifespan(config.lifespan())
        .pin_all(config.pinned)
        .clock(clock);
    if let Some(offheap) = config.tiers.offheap {
        builder = builder.offheap(offheap);
    }
    if let Some(disk) = &config.tiers.disk {
        std::fs::create_dir_all(&disk.directory)?;
        builder = builder.disk(disk.data_file(&config.name), disk.capacity);
    }
    builder.build()
}

// =============================================================================
// Local Cache
// =============================================================================

/// Named node-local cache
pub struct Cache {
    config: CacheConfig,
    store: Arc<TieredStore>,
    transactional: Option<Arc<LocalTransactionStore>>,
}

impl Cache {
    pub(crate) fn new(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        controller: &Arc<TransactionController>,
    ) -> Result<Self> {
        let store = build_store(&config, clock)?;
        let transactional = config
            .transactional
            .then(|| LocalTransactionStore::new(Arc::clone(&store), Arc::clone(controller)));
        debug!(cache = %config.name, transactional = config.transactional, "Created cache");
        Ok(Self {
            config,
            store,
            transactional,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional.is_some()
    }

    /// Transactional view; writes to a transactional cache go through it
    pub fn transactional(&self) -> Result<&Arc<LocalTransactionStore>> {
        self.transactional
            .as_ref()
            .ok_or_else(|| Error::NotTransactional(self.name().to_string()))
    }

    pub fn register_listener(&self, listener: Arc<dyn CacheEventListener>) {
        self.store.listeners().register(listener);
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.store.snapshot()
    }

    fn writable(&self) -> Result<&TieredStore> {
        if self.is_transactional() {
            return Err(Error::TransactionRequired(self.name().to_string()));
        }
        Ok(&self.store)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or update; `true` when the key was absent
    pub fn put(&self, element: Element) -> Result<bool> {
        self.writable()?.put(element)
    }

    pub fn put_if_absent(&self, element: Element) -> Result<Option<Element>> {
        self.writable()?.put_if_absent(element)
    }

    pub fn remove(&self, key: &CacheKey) -> Result<Option<Element>> {
        self.writable()?.remove(key)
    }

    pub fn remove_element(&self, element: &Element) -> Result<Option<Element>> {
        let store = self.writable()?;
        store.remove_element(element, &crate::store::DefaultElementValueComparator)
    }

    pub fn replace(&self, element: Element) -> Result<Option<Element>> {
        self.writable()?.replace(element)
    }

    pub fn replace_element(&self, old: &Element, new: Element) -> Result<bool> {
        let store = self.writable()?;
        store.replace_element(old, new, &crate::store::DefaultElementValueComparator)
    }

    pub fn remove_all(&self) -> Result<usize> {
        self.writable()?.remove_all()
    }

    // =========================================================================
    // Reads (committed values on transactional caches)
    // =========================================================================

    pub fn get(&self, key: &CacheKey) -> Result<Option<Element>> {
        match &self.transactional {
            Some(tx) => tx.read_committed(key),
            None => self.store.get(key),
        }
    }

    /// Read without touching statistics or access metadata
    pub fn get_quiet(&self, key: &CacheKey) -> Result<Option<Element>> {
        match &self.transactional {
            Some(tx) => tx.read_committed(key),
            None => self.store.get_quiet(key),
        }
    }

    pub fn get_keys(&self) -> Result<Vec<CacheKey>> {
        match &self.transactional {
            Some(tx) => tx.committed_keys(),
            None => Ok(self.store.keys()),
        }
    }

    pub fn get_size(&self) -> Result<usize> {
        match &self.transactional {
            Some(tx) => tx.committed_size(),
            None => Ok(self.store.size()),
        }
    }

    pub fn contains_key(&self, key: &CacheKey) -> Result<bool> {
        match &self.transactional {
            Some(tx) => Ok(tx.read_committed(key)?.is_some()),
            None => Ok(self.store.contains_key(key)),
        }
    }

    /// Drop expired elements from every tier
    pub fn expire_elements(&self) -> Result<usize> {
        self.store.expire_elements()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.config.name)
            .field("transactional", &self.is_transactional())
            .field("size", &self.store.size())
            .finish()
    }
}

// =============================================================================
// Clustered Cache
// =============================================================================

/// Named cache shared across the cluster
pub struct ClusteredCache {
    config: CacheConfig,
    store: NonstopStore,
}

impl ClusteredCache {
    pub(crate) fn new(config: CacheConfig, store: NonstopStore) -> Self {
        Self { config, store }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn nonstop(&self) -> &NonstopStore {
        &self.store
    }

    pub fn clustered_store(&self) -> &Arc<CoherentClusteredStore> {
        self.store.inner()
    }

    /// Node-local tiers serving `local_reads` fallbacks
    pub fn local_store(&self) -> &Arc<TieredStore> {
        self.store.inner().local_store()
    }

    pub fn register_listener(&self, listener: Arc<dyn CacheEventListener>) {
        self.store.inner().listeners().register(listener);
    }

    /// Cluster-level counters with this node's local tier sizes
    pub fn statistics(&self) -> StatisticsSnapshot {
        let local = self.local_store().snapshot();
        StatisticsSnapshot {
            size: local.size,
            in_memory_size: local.in_memory_size,
            off_heap_size: local.off_heap_size,
            on_disk_size: local.on_disk_size,
            in_memory_size_bytes: local.in_memory_size_bytes,
            off_heap_size_bytes: local.off_heap_size_bytes,
            on_disk_size_bytes: local.on_disk_size_bytes,
            ..self.store.inner().statistics().snapshot()
        }
    }

    pub async fn get(&self, ctx: &LockContext, key: &CacheKey) -> Result<Option<Element>> {
        self.store.get(ctx, key).await
    }

    pub async fn put(&self, ctx: &LockContext, element: Element) -> Result<bool> {
        self.store.put(ctx, element).await
    }

    pub async fn put_if_absent(&self, ctx: &LockContext, element: Element) -> Result<Option<Element>> {
        self.store.put_if_absent(ctx, element).await
    }

    pub async fn remove(&self, ctx: &LockContext, key: &CacheKey) -> Result<Option<Element>> {
        self.store.remove(ctx, key).await
    }

    pub async fn remove_element(&self, ctx: &LockContext, element: &Element) -> Result<Option<Element>> {
        self.store.remove_element(ctx, element).await
    }

    pub async fn replace(&self, ctx: &LockContext, element: Element) -> Result<Option<Element>> {
        self.store.replace(ctx, element).await
    }

    pub async fn replace_element(&self, ctx: &LockContext, old: &Element, new: Element) -> Result<bool> {
        self.store.replace_element(ctx, old, new).await
    }

    pub async fn remove_all(&self) -> Result<usize> {
        self.store.remove_all().await
    }

    pub async fn get_keys(&self) -> Result<Vec<CacheKey>> {
        self.store.keys().await
    }

    pub async fn get_size(&self) -> Result<usize> {
        self.store.size().await
    }

    pub async fn contains_key(&self, key: &CacheKey) -> Result<bool> {
        self.store.contains_key(key).await
    }

    // =========================================================================
    // Coherence and Locks
    // =========================================================================

    pub fn is_node_coherent(&self) -> bool {
        self.store.is_node_coherent()
    }

    pub fn is_cluster_coherent(&self) -> bool {
        self.store.is_cluster_coherent()
    }

    pub async fn set_node_coherent(&self, coherent: bool) -> Result<()> {
        self.store.set_node_coherent(coherent).await
    }

    pub async fn wait_until_cluster_coherent(&self) -> Result<()> {
        self.store.wait_until_cluster_coherent().await
    }

    pub async fn acquire_write_lock(&self, ctx: &LockContext, key: &CacheKey) -> Result<()> {
        self.store.acquire_write_lock(ctx, key).await
    }

    pub async fn try_acquire_write_lock(
        &self,
        ctx: &LockContext,
        key: &CacheKey,
        timeout: Duration,
    ) -> Result<bool> {
        self.store.try_acquire_write_lock(ctx, key, timeout).await
    }

    pub async fn release_write_lock(&self, ctx: &LockContext, key: &CacheKey) -> Result<()> {
        self.store.release_write_lock(ctx, key).await
    }

    pub async fn is_write_lock_held(&self, ctx: &LockContext, key: &CacheKey) -> Result<bool> {
        self.store.is_write_lock_held(ctx, key).await
    }

    pub fn expire_elements(&self) -> Result<usize> {
        self.local_store().expire_elements()
    }
}

impl std::fmt::Debug for ClusteredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredCache")
            .field("name", &self.config.name)
            .field("store", &self.store)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
