//! Coherent Clustered Store
//!
//! Fronts a [`ClusterBackend`] with a node-local [`TieredStore`]. In
//! coherent mode the cluster is authoritative and, under STRONG
//! consistency, every data operation holds the cluster lock for its key.
//! In incoherent (bulk-load) mode writes stay on this node, unlocked, and
//! are buffered until the node becomes coherent again.
//!
//! The local store doubles as the last-known-value cache served when a
//! clustered read times out under the `local_reads` behavior.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backend::ClusterBackend;
use super::lock::{LockClaim, LockContext, LockRelease};
use crate::error::{Error, Result};
use crate::event::{CacheEvent, ListenerRegistry};
use crate::statistics::CacheStatistics;
use crate::store::element::{
    CacheKey, DefaultElementValueComparator, Element, ElementValueComparator,
};
use crate::store::{TierKind, TieredStore};

/// Cluster-wide consistency of data operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Each operation holds the cluster lock for its key
    #[default]
    Strong,
    /// No cluster locking; last writer wins
    Eventual,
}

impl Consistency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Strong => "strong",
            Consistency::Eventual => "eventual",
        }
    }
}

/// Period of the background bulk-load flush
pub const BULK_LOAD_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Buffered writes that trigger an immediate flush
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
enum PendingWrite {
    Put(Element),
    Remove,
}

#[derive(Debug, Clone)]
struct Buffered {
    sequence: u64,
    write: PendingWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Local,
    Cluster,
}

/// Clustered store with coherent and bulk-load modes
pub struct CoherentClusteredStore {
    name: String,
    local: Arc<TieredStore>,
    backend: Arc<dyn ClusterBackend>,
    consistency: Consistency,
    node_coherent: AtomicBool,
    mode: RwLock<()>,
    pending: Mutex<HashMap<CacheKey, Buffered>>,
    next_sequence: AtomicU64,
    flush_threshold: usize,
    flushing: AsyncMutex<()>,
    statistics: Arc<CacheStatistics>,
    listeners: Arc<ListenerRegistry>,
    comparator: Arc<dyn ElementValueComparator>,
    shutdown: CancellationToken,
}

impl CoherentClusteredStore {
    /// Create a coherent-mode store named after `local`
    pub fn new(
        local: Arc<TieredStore>,
        backend: Arc<dyn ClusterBackend>,
        consistency: Consistency,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: local.name().to_string(),
            local,
            backend,
            consistency,
            node_coherent: AtomicBool::new(true),
            mode: RwLock::new(()),
            pending: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flushing: AsyncMutex::new(()),
            statistics: Arc::new(CacheStatistics::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            comparator: Arc::new(DefaultElementValueComparator),
            shutdown,
        }
    }

    pub fn with_statistics(mut self, statistics: Arc<CacheStatistics>) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn with_listeners(mut self, listeners: Arc<ListenerRegistry>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Buffered writes at which a bulk-loading writer flushes inline
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node-local tiers holding last known values
    pub fn local_store(&self) -> &Arc<TieredStore> {
        &self.local
    }

    pub fn backend(&self) -> &Arc<dyn ClusterBackend> {
        &self.backend
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn statistics(&self) -> &Arc<CacheStatistics> {
        &self.statistics
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Writes buffered while incoherent
    pub fn pending_writes(&self) -> usize {
        self.pending.lock().len()
    }

    // =========================================================================
    // Coherence
    // =========================================================================

    pub fn is_node_coherent(&self) -> bool {
        self.node_coherent.load(Ordering::Acquire)
    }

    pub fn is_cluster_coherent(&self) -> bool {
        self.backend.is_cluster_coherent(&self.name)
    }

    /// Switch this node between coherent and bulk-load mode
    ///
    /// Entering coherent mode flushes buffered writes to the cluster first.
    /// Data operations wait only until the flag flips, not for the rest of
    /// the cluster.
    #[instrument(skip(self), fields(cache = %self.name))]
    pub async fn set_node_coherent(&self, coherent: bool) -> Result<()> {
        let _gate = self.mode.write().await;
        if self.is_node_coherent() == coherent {
            return Ok(());
        }

        if coherent {
            let flushed = self.flush_pending().await?;
            self.backend.set_node_coherent(&self.name, true).await?;
            self.node_coherent.store(true, Ordering::Release);
            info!(cache = %self.name, flushed, "Node coherent again");
        } else {
            self.backend.set_node_coherent(&self.name, false).await?;
            self.node_coherent.store(false, Ordering::Release);
            info!(cache = %self.name, "Node entered bulk-load mode");
        }
        Ok(())
    }

    /// Wait until every node is coherent; only shutdown cancels the wait
    pub async fn wait_until_cluster_coherent(&self) -> Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Shutdown),
            result = self.backend.wait_until_cluster_coherent(&self.name) => result,
        }
    }

    /// Push bulk-load writes to the cluster every `interval` while this
    /// node is incoherent
    ///
    /// The task stops on shutdown or once the store is dropped.
    pub fn spawn_bulk_load_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        store.flush_while_incoherent().await;
                    }
                }
            }
            debug!("Bulk-load flusher stopped");
        })
    }

    async fn flush_while_incoherent(&self) {
        if self.is_node_coherent() || self.pending_writes() == 0 {
            return;
        }
        let _gate = self.mode.read().await;
        if self.is_node_coherent() {
            return;
        }
        if let Err(e) = self.flush_pending().await {
            debug!(cache = %self.name, error = %e, "Background flush will retry");
        }
    }

    // =========================================================================
    // Explicit Locks
    // =========================================================================

    pub async fn acquire_write_lock(&self, ctx: &LockContext, key: &CacheKey) -> Result<()> {
        self.acquire_claimed(ctx, key, &LockClaim::new()).await
    }

    pub async fn try_acquire_write_lock(
        &self,
        ctx: &LockContext,
        key: &CacheKey,
        timeout: Duration,
    ) -> Result<bool> {
        self.try_acquire_claimed(ctx, key, timeout, &LockClaim::new())
            .await
    }

    /// Acquire on behalf of a caller that may stop waiting
    ///
    /// If `claim` was abandoned by the time the lock is granted, the hold
    /// is dropped again and the cluster lock released.
    pub(crate) async fn acquire_claimed(
        &self,
        ctx: &LockContext,
        key: &CacheKey,
        claim: &LockClaim,
    ) -> Result<()> {
        if !ctx.reenter(&self.name, key) {
            self.backend.lock(&self.name, key, ctx.holder()).await?;
            ctx.acquired(&self.name, key);
        }
        self.settle(ctx, key, claim).await
    }

    pub(crate) async fn try_acquire_claimed(
        &self,
        ctx: &LockContext,
        key: &CacheKey,
        timeout: Duration,
        claim: &LockClaim,
    ) -> Result<bool> {
        if !ctx.reenter(&self.name, key) {
            let acquired = self
                .backend
                .try_lock(&self.name, key, ctx.holder(), timeout)
                .await?;
            if !acquired {
                return Ok(false);
            }
            ctx.acquired(&self.name, key);
        }
        self.settle(ctx, key, claim).await?;
        Ok(true)
    }

    /// Keep a fresh hold, or give it back if the caller has gone
    async fn settle(&self, ctx: &LockContext, key: &CacheKey, claim: &LockClaim) -> Result<()> {
        if claim.complete() {
            return Ok(());
        }
        if ctx.release(&self.name, key) == LockRelease::Released {
            self.unlock_remote(ctx, key).await?;
        }
        debug!(cache = %self.name, %key, "Released lock granted after caller timed out");
        Err(Error::ClusterTimeout {
            operation: "acquire_write_lock".to_string(),
        })
    }

    /// Drop one hold; the local stack is updated before the cluster is told
    pub async fn release_write_lock(&self, ctx: &LockContext, key: &CacheKey) -> Result<()> {
        match self.release_local(ctx, key)? {
            LockRelease::Released => self.unlock_remote(ctx, key).await,
            _ => Ok(()),
        }
    }

    pub async fn is_write_lock_held(&self, ctx: &LockContext, key: &CacheKey) -> Result<bool> {
        self.backend
            .is_locked_by(&self.name, key, ctx.holder())
            .await
    }

    pub(crate) fn release_local(&self, ctx: &LockContext, key: &CacheKey) -> Result<LockRelease> {
        match ctx.release(&self.name, key) {
            LockRelease::NotHeld => Err(Error::InvalidLockState {
                key: key.to_string(),
                reason: format!("lock context {} holds no lock", ctx.holder()),
            }),
            release => Ok(release),
        }
    }

    pub(crate) async fn unlock_remote(&self, ctx: &LockContext, key: &CacheKey) -> Result<()> {
        self.backend
            .unlock(&self.name, key, ctx.holder())
            .await
            .inspect_err(|e| warn!(cache = %self.name, %key, error = %e, "Cluster unlock failed"))
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    pub async fn get(&self, ctx: &LockContext, key: &CacheKey) -> Result<Option<Element>> {
        let started = Instant::now();
        let _gate = self.mode.read().await;
        let coherent = self.is_node_coherent();

        let found = self
            .with_key_lock(ctx, key, coherent, async {
                let now = self.local.clock().now_millis();
                match self.lookup(key, coherent).await? {
                    Some((element, _)) if element.is_expired(now) => {
                        self.delete(key, coherent).await?;
                        self.statistics.record_expired_miss();
                        self.statistics.record_expiration();
                        self.listeners
                            .dispatch(&CacheEvent::expired(&self.name, key.as_str()));
                        Ok(None)
                    }
                    Some((element, Source::Local)) => {
                        self.statistics.record_hit(TierKind::OnHeap);
                        Ok(Some(element))
                    }
                    Some((element, Source::Cluster)) => {
                        self.statistics.record_cluster_hit();
                        if coherent {
                            self.local.put(element.clone())?;
                        }
                        Ok(Some(element))
                    }
                    None => {
                        self.statistics.record_miss();
                        if coherent {
                            self.local.remove(key)?;
                        }
                        Ok(None)
                    }
                }
            })
            .await?;

        self.statistics.record_get_latency(started.elapsed());
        Ok(found)
    }

    /// Insert or update; `true` when the key was absent
    #[instrument(skip(self, ctx, element), fields(cache = %self.name, key = %element.key()))]
    pub async fn put(&self, ctx: &LockContext, element: Element) -> Result<bool> {
        Self::ensure_plain(&element)?;
        let key = element.key().clone();
        let _gate = self.mode.read().await;
        let coherent = self.is_node_coherent();

        self.with_key_lock(ctx, &key, coherent, async {
            let previous = self.current(&key, coherent).await?;
            self.write(element, previous.as_ref(), coherent).await?;
            Ok(previous.is_none())
        })
        .await
    }

    /// Insert unless a live mapping exists; returns the existing element
    pub async fn put_if_absent(&self, ctx: &LockContext, element: Element) -> Result<Option<Element>> {
        Self::ensure_plain(&element)?;
        let key = element.key().clone();
        let _gate = self.mode.read().await;
        let coherent = self.is_node_coherent();

        self.with_key_lock(ctx, &key, coherent, async {
            match self.current(&key, coherent).await? {
                Some(existing) => Ok(Some(existing)),
                None => {
                    self.write(element, None, coherent).await?;
                    Ok(None)
                }
            }
        })
        .await
    }

    pub async fn remove(&self, ctx: &LockContext, key: &CacheKey) -> Result<Option<Element>> {
        let _gate = self.mode.read().await;
        let coherent = self.is_node_coherent();

        self.with_key_lock(ctx, key, coherent, async {
            let previous = self.current(key, coherent).await?;
            if previous.is_some() {
                self.erase(key, coherent).await?;
            }
            Ok(previous)
        })
        .await
    }

    /// Remove only if the current value equals `element`
    pub async fn remove_element(
        &self,
        ctx: &LockContext,
        element: &Element,
    ) -> Result<Option<Element>> {
        let key = element.key().clone();
        let _gate = self.mode.read().await;
        let coherent = self.is_node_coherent();

        self.with_key_lock(ctx, &key, coherent, async {
            match self.current(&key, coherent).await? {
                Some(current) if self.comparator.equals(&current, element) => {
                    self.erase(&key, coherent).await?;
                    Ok(Some(current))
                }
                _ => Ok(None),
            }
        })
        .await
    }

    /// Overwrite an existing mapping; returns the replaced element
    pub async fn replace(&self, ctx: &LockContext, element: Element) -> Result<Option<Element>> {
        Self::ensure_plain(&element)?;
        let key = element.key().clone();
        let _gate = self.mode.read().await;
        let coherent = self.is_node_coherent();

        self.with_key_lock(ctx, &key, coherent, async {
            let previous = self.current(&key, coherent).await?;
            if let Some(previous) = &previous {
                self.write(element, Some(previous), coherent).await?;
            }
            Ok(previous)
        })
        .await
    }

    /// Swap in `new` only if the current value equals `old`
    pub async fn replace_element(
        &self,
        ctx: &LockContext,
        old: &Element,
        new: Element,
    ) -> Result<bool> {
        Self::ensure_plain(&new)?;
        let key = new.key().clone();
        let _gate = self.mode.read().await;
        let coherent = self.is_node_coherent();

        self.with_key_lock(ctx, &key, coherent, async {
            match self.current(&key, coherent).await? {
                Some(current) if self.comparator.equals(&current, old) => {
                    self.write(new, Some(&current), coherent).await?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    /// Clear the cache cluster-wide and locally
    pub async fn remove_all(&self) -> Result<usize> {
        let _gate = self.mode.read().await;
        let removed = self.backend.remove_all(&self.name).await?;
        let local = self.local.remove_all()?;
        self.pending.lock().clear();
        let removed = removed.max(local);
        self.listeners
            .dispatch(&CacheEvent::remove_all(&self.name, removed));
        Ok(removed)
    }

    /// Keys visible from this node
    pub async fn keys(&self) -> Result<Vec<CacheKey>> {
        let _gate = self.mode.read().await;
        let cluster = self.backend.keys(&self.name).await?;
        if self.is_node_coherent() {
            return Ok(cluster);
        }

        // key -> buffered as a put (true) or a remove (false)
        let pending: HashMap<CacheKey, bool> = self
            .pending
            .lock()
            .iter()
            .map(|(key, b)| (key.clone(), matches!(b.write, PendingWrite::Put(_))))
            .collect();
        let buffered_puts = pending
            .iter()
            .filter(|(_, put)| **put)
            .map(|(key, _)| key.clone());

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for key in cluster
            .into_iter()
            .chain(self.local.keys())
            .chain(buffered_puts)
        {
            if pending.get(&key) == Some(&false) {
                continue;
            }
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    pub async fn size(&self) -> Result<usize> {
        if self.is_node_coherent() {
            let _gate = self.mode.read().await;
            return self.backend.size(&self.name).await;
        }
        Ok(self.keys().await?.len())
    }

    pub async fn contains_key(&self, key: &CacheKey) -> Result<bool> {
        let _gate = self.mode.read().await;
        let coherent = self.is_node_coherent();
        Ok(self.current(key, coherent).await?.is_some())
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn ensure_plain(element: &Element) -> Result<()> {
        if element.is_soft_locked() {
            return Err(Error::Internal(format!(
                "soft-locked element for key {} cannot be clustered",
                element.key()
            )));
        }
        Ok(())
    }

    /// Run `body` under the cluster lock for `key` when locking applies
    ///
    /// The lock is released whether `body` fails or panics.
    async fn with_key_lock<T, F>(
        &self,
        ctx: &LockContext,
        key: &CacheKey,
        coherent: bool,
        body: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !coherent || self.consistency == Consistency::Eventual {
            return body.await;
        }

        self.acquire_write_lock(ctx, key).await?;
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        let released = self.release_write_lock(ctx, key).await;

        match outcome {
            Ok(Ok(value)) => released.map(|()| value),
            Ok(Err(e)) => Err(e),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Raw lookup, expired elements included
    async fn lookup(&self, key: &CacheKey, coherent: bool) -> Result<Option<(Element, Source)>> {
        if !coherent {
            let buffered = self.pending.lock().get(key).map(|b| b.write.clone());
            match buffered {
                Some(PendingWrite::Put(element)) => return Ok(Some((element, Source::Local))),
                Some(PendingWrite::Remove) => return Ok(None),
                None => {}
            }
            if let Some(local) = self.local.get_quiet(key)? {
                return Ok(Some((local, Source::Local)));
            }
        }
        Ok(self
            .backend
            .get(&self.name, key)
            .await?
            .map(|element| (element, Source::Cluster)))
    }

    /// Live value visible from this node, without statistics
    async fn current(&self, key: &CacheKey, coherent: bool) -> Result<Option<Element>> {
        let now = self.local.clock().now_millis();
        Ok(self
            .lookup(key, coherent)
            .await?
            .map(|(element, _)| element)
            .filter(|element| !element.is_expired(now)))
    }

    /// Stamp, store and announce a write over `previous`
    async fn write(&self, element: Element, previous: Option<&Element>, coherent: bool) -> Result<()> {
        let now = self.local.clock().now_millis();
        let lifespan = self.local.lifespan();
        let mut element = element;
        element.apply_default_lifespan(lifespan.time_to_live, lifespan.time_to_idle, lifespan.eternal);
        match previous {
            Some(previous) => element.stamp_update(previous, now, 0),
            None => element.stamp_insert(now, 0),
        }

        let key = element.key().clone();
        let version = element.version();
        if coherent {
            self.backend.put(&self.name, element.clone()).await?;
            self.local.put(element)?;
        } else {
            self.local.put(element.clone())?;
            self.buffer(key.clone(), PendingWrite::Put(element));
        }

        let event = match previous {
            Some(previous) => {
                self.statistics.record_update();
                CacheEvent::updated(&self.name, key.as_str(), previous.version(), version)
            }
            None => {
                self.statistics.record_put();
                CacheEvent::put(&self.name, key.as_str(), version)
            }
        };
        self.listeners.dispatch(&event);

        if !coherent && self.pending_writes() >= self.flush_threshold {
            if let Err(e) = self.flush_pending().await {
                debug!(cache = %self.name, error = %e, "Inline flush failed; writes stay buffered");
            }
        }
        Ok(())
    }

    async fn erase(&self, key: &CacheKey, coherent: bool) -> Result<()> {
        self.delete(key, coherent).await?;
        self.statistics.record_remove();
        self.listeners
            .dispatch(&CacheEvent::removed(&self.name, key.as_str()));
        Ok(())
    }

    async fn delete(&self, key: &CacheKey, coherent: bool) -> Result<()> {
        if coherent {
            self.backend.remove(&self.name, key).await?;
        } else {
            self.buffer(key.clone(), PendingWrite::Remove);
        }
        self.local.remove(key)?;
        Ok(())
    }

    fn buffer(&self, key: CacheKey, write: PendingWrite) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(key, Buffered { sequence, write });
    }

    /// Push buffered bulk-load writes to the cluster
    ///
    /// An entry leaves the buffer once the cluster has it, unless a newer
    /// write for the key was buffered meanwhile. On error the unflushed
    /// entries stay buffered.
    async fn flush_pending(&self) -> Result<usize> {
        let _flushing = self.flushing.lock().await;
        let snapshot: Vec<(CacheKey, Buffered)> = self
            .pending
            .lock()
            .iter()
            .map(|(key, b)| (key.clone(), b.clone()))
            .collect();
        let ctx = LockContext::new();

        let mut flushed = 0;
        for (key, buffered) in snapshot {
            let pushed = self
                .with_key_lock(&ctx, &key, true, async {
                    match &buffered.write {
                        PendingWrite::Put(element) => {
                            self.backend.put(&self.name, element.clone()).await?;
                        }
                        PendingWrite::Remove => {
                            self.backend.remove(&self.name, &key).await?;
                        }
                    }
                    Ok(())
                })
                .await;

            if let Err(e) = pushed {
                warn!(cache = %self.name, error = %e, flushed, "Flush aborted; writes kept buffered");
                return Err(e);
            }

            let mut pending = self.pending.lock();
            if pending
                .get(&key)
                .is_some_and(|current| current.sequence == buffered.sequence)
            {
                pending.remove(&key);
            }
            flushed += 1;
        }

        debug!(cache = %self.name, flushed, "Flushed bulk-load buffer");
        Ok(flushed)
    }
}

impl std::fmt::Debug for CoherentClusteredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherentClusteredStore")
            .field("name", &self.name)
            .field("node", self.backend.node_id())
            .field("consistency", &self.consistency)
            .field("node_coherent", &self.is_node_coherent())
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::event::{CacheEventListener, InMemoryEventCollector};
    use crate::store::ManualClock;

    fn node(cluster: &InMemoryCluster, id: &str, consistency: Consistency) -> Arc<CoherentClusteredStore> {
        let local = TieredStore::builder("shared").build().unwrap();
        Arc::new(CoherentClusteredStore::new(
            local,
            cluster.join(id),
            consistency,
            CancellationToken::new(),
        ))
    }

    fn bytes(element: Option<Element>) -> Option<Vec<u8>> {
        element.and_then(|e| e.value().map(|b| b.to_vec()))
    }

    #[tokio::test]
    async fn test_writes_visible_across_nodes() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        let b = node(&cluster, "b", Consistency::Strong);
        let ctx = LockContext::new();

        assert!(a.put(&ctx, Element::new("k", "1")).await.unwrap());
        assert!(!b.put(&ctx, Element::new("k", "2")).await.unwrap());
        assert_eq!(bytes(a.get(&ctx, &"k".into()).await.unwrap()), Some(b"2".to_vec()));
        assert_eq!(a.size().await.unwrap(), 1);
        assert_eq!(ctx.total_holds(), 0);
        assert_eq!(cluster.locks_held_by(a.backend().node_id()), 0);

        assert_eq!(
            bytes(b.remove(&ctx, &"k".into()).await.unwrap()),
            Some(b"2".to_vec())
        );
        assert!(a.get(&ctx, &"k".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_refresh_local_copy() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        let b = node(&cluster, "b", Consistency::Strong);
        let ctx = LockContext::new();

        a.put(&ctx, Element::new("k", "v")).await.unwrap();
        assert!(b.local_store().get_quiet(&"k".into()).unwrap().is_none());
        b.get(&ctx, &"k".into()).await.unwrap();
        assert!(b.local_store().get_quiet(&"k".into()).unwrap().is_some());
        assert_eq!(b.statistics().snapshot().cluster_hits, 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_operations() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        let ctx = LockContext::new();

        assert!(a.put_if_absent(&ctx, Element::new("k", "1")).await.unwrap().is_none());
        assert!(a.put_if_absent(&ctx, Element::new("k", "2")).await.unwrap().is_some());
        assert!(!a
            .replace_element(&ctx, &Element::new("k", "x"), Element::new("k", "3"))
            .await
            .unwrap());
        assert!(a
            .replace_element(&ctx, &Element::new("k", "1"), Element::new("k", "3"))
            .await
            .unwrap());
        assert!(a.replace(&ctx, Element::new("absent", "v")).await.unwrap().is_none());
        assert!(a.remove_element(&ctx, &Element::new("k", "1")).await.unwrap().is_none());
        assert!(a.remove_element(&ctx, &Element::new("k", "3")).await.unwrap().is_some());
        assert!(!a.contains_key(&"k".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_strong_operation_waits_for_explicit_lock() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        let b = node(&cluster, "b", Consistency::Strong);
        let holder = LockContext::new();
        let key = CacheKey::new("k");

        a.acquire_write_lock(&holder, &key).await.unwrap();
        let blocked = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.put(&LockContext::new(), Element::new("k", "v")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        a.release_write_lock(&holder, &key).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_eventual_consistency_skips_locks() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        let b = node(&cluster, "b", Consistency::Eventual);
        let holder = LockContext::new();
        let key = CacheKey::new("k");

        a.acquire_write_lock(&holder, &key).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            b.put(&LockContext::new(), Element::new("k", "v")),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_reentrant_explicit_lock_allows_own_operations() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        let ctx = LockContext::new();
        let key = CacheKey::new("k");

        a.acquire_write_lock(&ctx, &key).await.unwrap();
        a.put(&ctx, Element::new("k", "v")).await.unwrap();
        assert_eq!(ctx.hold_count("shared", &key), 1);
        assert!(a.is_write_lock_held(&ctx, &key).await.unwrap());

        a.release_write_lock(&ctx, &key).await.unwrap();
        assert!(!a.is_write_lock_held(&ctx, &key).await.unwrap());
        let err = a.release_write_lock(&ctx, &key).await.unwrap_err();
        assert!(matches!(err, Error::InvalidLockState { .. }));
    }

    #[tokio::test]
    async fn test_lock_released_when_body_panics() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        let ctx = LockContext::new();
        let key = CacheKey::new("k");

        let outcome = AssertUnwindSafe(a.with_key_lock(&ctx, &key, true, async {
            if ctx.total_holds() > 0 {
                panic!("boom");
            }
            Ok(())
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(ctx.total_holds(), 0);
        assert_eq!(cluster.locks_held_by(a.backend().node_id()), 0);
    }

    #[tokio::test]
    async fn test_bulk_load_buffers_until_coherent() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        let b = node(&cluster, "b", Consistency::Strong);
        let ctx = LockContext::new();

        b.put(&ctx, Element::new("gone", "v")).await.unwrap();
        a.set_node_coherent(false).await.unwrap();
        assert!(!a.is_node_coherent());
        assert!(!a.is_cluster_coherent());

        for i in 0..10 {
            a.put(&ctx, Element::new(format!("k{}", i), "v")).await.unwrap();
        }
        a.remove(&ctx, &"gone".into()).await.unwrap();
        assert_eq!(a.pending_writes(), 11);
        assert_eq!(cluster.entries("shared"), 1);
        assert_eq!(a.size().await.unwrap(), 10);
        assert!(a.get(&ctx, &"gone".into()).await.unwrap().is_none());

        a.set_node_coherent(true).await.unwrap();
        assert_eq!(a.pending_writes(), 0);
        assert_eq!(cluster.entries("shared"), 10);
        assert!(b.get(&ctx, &"k3".into()).await.unwrap().is_some());
        assert!(a.is_cluster_coherent());
    }

    fn bounded_node(cluster: &InMemoryCluster, id: &str, heap: u64) -> CoherentClusteredStore {
        let local = TieredStore::builder("shared")
            .heap(crate::store::TierCapacity::entries(heap))
            .build()
            .unwrap();
        CoherentClusteredStore::new(local, cluster.join(id), Consistency::Strong, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_bulk_load_reads_buffered_writes_past_local_capacity() {
        let cluster = InMemoryCluster::new();
        let a = bounded_node(&cluster, "a", 2);
        let ctx = LockContext::new();

        a.put(&ctx, Element::new("k0", "old")).await.unwrap();
        a.set_node_coherent(false).await.unwrap();
        for i in 0..5 {
            a.put(&ctx, Element::new(format!("k{}", i), "new")).await.unwrap();
        }
        assert_eq!(a.pending_writes(), 5);
        assert!(a.local_store().size() <= 2);

        for i in 0..5 {
            let found = a.get(&ctx, &format!("k{}", i).into()).await.unwrap();
            assert_eq!(bytes(found), Some(b"new".to_vec()));
        }
        assert_eq!(a.size().await.unwrap(), 5);
        assert!(a.contains_key(&"k4".into()).await.unwrap());
        assert_eq!(cluster.entries("shared"), 1);
    }

    #[tokio::test]
    async fn test_background_flusher_drains_buffer_while_incoherent() {
        let cluster = InMemoryCluster::new();
        let a = Arc::new(bounded_node(&cluster, "a", 2));
        let ctx = LockContext::new();
        a.set_node_coherent(false).await.unwrap();
        let flusher = a.spawn_bulk_load_flusher(Duration::from_millis(10));

        for i in 0..6 {
            a.put(&ctx, Element::new(format!("k{}", i), "v")).await.unwrap();
        }
        a.remove(&ctx, &"k5".into()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while a.pending_writes() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(!a.is_node_coherent());
        assert_eq!(cluster.entries("shared"), 5);
        assert_eq!(a.size().await.unwrap(), 5);
        assert!(a.get(&ctx, &"k0".into()).await.unwrap().is_some());
        assert!(a.get(&ctx, &"k5".into()).await.unwrap().is_none());

        a.shutdown.cancel();
        flusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_threshold_pushes_inline() {
        let cluster = InMemoryCluster::new();
        let a = bounded_node(&cluster, "a", 10).with_flush_threshold(3);
        let ctx = LockContext::new();
        a.set_node_coherent(false).await.unwrap();

        a.put(&ctx, Element::new("k0", "v")).await.unwrap();
        a.put(&ctx, Element::new("k1", "v")).await.unwrap();
        assert_eq!(cluster.entries("shared"), 0);
        a.put(&ctx, Element::new("k2", "v")).await.unwrap();

        assert_eq!(a.pending_writes(), 0);
        assert_eq!(cluster.entries("shared"), 3);
        assert!(!a.is_node_coherent());
    }

    #[tokio::test]
    async fn test_abandoned_claim_gives_lock_back() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        let b = node(&cluster, "b", Consistency::Strong);
        let ctx = LockContext::new();
        let key = CacheKey::new("k");

        let claim = LockClaim::new();
        assert!(claim.abandon());
        let result = a.acquire_claimed(&ctx, &key, &claim).await;
        assert!(matches!(result, Err(Error::ClusterTimeout { .. })));
        assert_eq!(ctx.total_holds(), 0);

        let other = LockContext::new();
        assert!(b
            .try_acquire_write_lock(&other, &key, Duration::from_millis(50))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_set_node_coherent_is_idempotent() {
        let cluster = InMemoryCluster::new();
        let a = node(&cluster, "a", Consistency::Strong);
        a.set_node_coherent(true).await.unwrap();
        assert!(a.is_node_coherent());
        a.set_node_coherent(false).await.unwrap();
        a.set_node_coherent(false).await.unwrap();
        assert!(!a.is_node_coherent());
    }

    #[tokio::test]
    async fn test_wait_cancelled_by_shutdown() {
        let cluster = InMemoryCluster::new();
        let shutdown = CancellationToken::new();
        let local = TieredStore::builder("shared").build().unwrap();
        let a = Arc::new(CoherentClusteredStore::new(
            local,
            cluster.join("a"),
            Consistency::Strong,
            shutdown.clone(),
        ));
        a.set_node_coherent(false).await.unwrap();

        let waiter = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.wait_until_cluster_coherent().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_expired_cluster_value_is_removed() {
        let cluster = InMemoryCluster::new();
        let clock = Arc::new(ManualClock::default());
        let local = TieredStore::builder("shared")
            .clock(clock.clone())
            .build()
            .unwrap();
        let collector = Arc::new(InMemoryEventCollector::new());
        let listeners = Arc::new(ListenerRegistry::new());
        listeners.register(Arc::clone(&collector) as Arc<dyn CacheEventListener>);
        let a = CoherentClusteredStore::new(
            local,
            cluster.join("a"),
            Consistency::Strong,
            CancellationToken::new(),
        )
        .with_listeners(listeners);
        let ctx = LockContext::new();

        a.put(&ctx, Element::new("k", "v").with_time_to_live(5)).await.unwrap();
        clock.advance(Duration::from_secs(6));

        assert!(a.get(&ctx, &"k".into()).await.unwrap().is_none());
        assert_eq!(cluster.entries("shared"), 0);
        assert_eq!(collector.keys_of_type("Expired"), vec!["k".to_string()]);
        assert_eq!(a.statistics().snapshot().expired_misses, 1);
    }
}
