//! Nonstop Store
//!
//! Deadline-bounded facade over a [`CoherentClusteredStore`]. Each call is
//! packaged as a [`ClusterCall`] and run by the shared
//! [`NonstopExecutor`]; on timeout the configured [`TimeoutBehavior`]
//! decides the outcome. Lock acquisition, release and coherence
//! transitions always raise.
//!
//! [`TimeoutBehavior`]: super::TimeoutBehavior

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use super::behavior::{ClusterCall, OperationKind};
use super::executor::NonstopExecutor;
use crate::cluster::{CoherentClusteredStore, LockClaim, LockContext, LockRelease};
use crate::config::NonstopSettings;
use crate::error::{Error, Result};
use crate::store::element::{CacheKey, Element};
use crate::store::TieredStore;

pub struct NonstopStore {
    inner: Arc<CoherentClusteredStore>,
    executor: Arc<NonstopExecutor>,
    settings: NonstopSettings,
}

impl NonstopStore {
    pub fn new(
        inner: Arc<CoherentClusteredStore>,
        executor: Arc<NonstopExecutor>,
        settings: NonstopSettings,
    ) -> Self {
        Self {
            inner,
            executor,
            settings,
        }
    }

    pub fn inner(&self) -> &Arc<CoherentClusteredStore> {
        &self.inner
    }

    pub fn settings(&self) -> &NonstopSettings {
        &self.settings
    }

    fn local(&self) -> Arc<TieredStore> {
        Arc::clone(self.inner.local_store())
    }

    fn call<T, F>(&self, name: &'static str, kind: OperationKind, future: F) -> ClusterCall<T>
    where
        T: Default + Send + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        ClusterCall::new(name, kind, future).with_statistics(Arc::clone(self.inner.statistics()))
    }

    async fn run<T>(&self, op: ClusterCall<T>) -> Result<T>
    where
        T: Default + Send + 'static,
    {
        if self.settings.enabled
            && self.settings.immediate_timeout
            && !self.inner.backend().is_online()
        {
            return self.executor.timed_out_immediately(op, &self.settings);
        }
        self.executor
            .execute_cluster_operation(op, &self.settings)
            .await
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    #[instrument(skip(self, ctx), fields(cache = %self.inner.name()))]
    pub async fn get(&self, ctx: &LockContext, key: &CacheKey) -> Result<Option<Element>> {
        let (store, ctx, k) = (Arc::clone(&self.inner), ctx.clone(), key.clone());
        let local = self.local();
        let key = key.clone();
        let op = self
            .call("get", OperationKind::Read, async move { store.get(&ctx, &k).await })
            .with_local(move || local.get_quiet(&key));
        self.run(op).await
    }

    pub async fn put(&self, ctx: &LockContext, element: Element) -> Result<bool> {
        let (store, ctx) = (Arc::clone(&self.inner), ctx.clone());
        let op = self.call("put", OperationKind::Write, async move {
            store.put(&ctx, element).await
        });
        self.run(op).await
    }

    pub async fn put_if_absent(
        &self,
        ctx: &LockContext,
        element: Element,
    ) -> Result<Option<Element>> {
        let (store, ctx) = (Arc::clone(&self.inner), ctx.clone());
        let op = self.call("put_if_absent", OperationKind::Write, async move {
            store.put_if_absent(&ctx, element).await
        });
        self.run(op).await
    }

    pub async fn remove(&self, ctx: &LockContext, key: &CacheKey) -> Result<Option<Element>> {
        let (store, ctx, key) = (Arc::clone(&self.inner), ctx.clone(), key.clone());
        let op = self.call("remove", OperationKind::Write, async move {
            store.remove(&ctx, &key).await
        });
        self.run(op).await
    }

    pub async fn remove_element(
        &self,
        ctx: &LockContext,
        element: &Element,
    ) -> Result<Option<Element>> {
        let (store, ctx, element) = (Arc::clone(&self.inner), ctx.clone(), element.clone());
        let op = self.call("remove_element", OperationKind::Write, async move {
            store.remove_element(&ctx, &element).await
        });
        self.run(op).await
    }

    pub async fn replace(&self, ctx: &LockContext, element: Element) -> Result<Option<Element>> {
        let (store, ctx) = (Arc::clone(&self.inner), ctx.clone());
        let op = self.call("replace", OperationKind::Write, async move {
            store.replace(&ctx, element).await
        });
        self.run(op).await
    }

    pub async fn replace_element(
        &self,
        ctx: &LockContext,
        old: &Element,
        new: Element,
    ) -> Result<bool> {
        let (store, ctx, old) = (Arc::clone(&self.inner), ctx.clone(), old.clone());
        let op = self.call("replace_element", OperationKind::Write, async move {
            store.replace_element(&ctx, &old, new).await
        });
        self.run(op).await
    }

    pub async fn remove_all(&self) -> Result<usize> {
        let store = Arc::clone(&self.inner);
        let op = self.call("remove_all", OperationKind::Write, async move {
            store.remove_all().await
        });
        self.run(op).await
    }

    pub async fn keys(&self) -> Result<Vec<CacheKey>> {
        let store = Arc::clone(&self.inner);
        let local = self.local();
        let op = self
            .call("keys", OperationKind::Read, async move { store.keys().await })
            .with_local(move || Ok(local.keys()));
        self.run(op).await
    }

    pub async fn size(&self) -> Result<usize> {
        let store = Arc::clone(&self.inner);
        let local = self.local();
        let op = self
            .call("size", OperationKind::Read, async move { store.size().await })
            .with_local(move || Ok(local.size()));
        self.run(op).await
    }

    pub async fn contains_key(&self, key: &CacheKey) -> Result<bool> {
        let (store, k) = (Arc::clone(&self.inner), key.clone());
        let local = self.local();
        let key = key.clone();
        let op = self
            .call("contains_key", OperationKind::Read, async move {
                store.contains_key(&k).await
            })
            .with_local(move || Ok(local.contains_key(&key)));
        self.run(op).await
    }

    // =========================================================================
    // Coherence
    // =========================================================================

    pub fn is_node_coherent(&self) -> bool {
        self.inner.is_node_coherent()
    }

    pub fn is_cluster_coherent(&self) -> bool {
        self.inner.is_cluster_coherent()
    }

    pub async fn set_node_coherent(&self, coherent: bool) -> Result<()> {
        let store = Arc::clone(&self.inner);
        let op = self.call("set_node_coherent", OperationKind::Coherence, async move {
            store.set_node_coherent(coherent).await
        });
        self.run(op).await
    }

    /// Unbounded barrier; only shutdown ends it early
    pub async fn wait_until_cluster_coherent(&self) -> Result<()> {
        self.inner.wait_until_cluster_coherent().await
    }

    // =========================================================================
    // Explicit Locks
    // =========================================================================

    /// Acquire the cluster lock on `key`
    ///
    /// On timeout the request is abandoned; if the cluster grants the lock
    /// afterwards it is released again, so a failed call never leaves a
    /// hold behind.
    pub async fn acquire_write_lock(&self, ctx: &LockContext, key: &CacheKey) -> Result<()> {
        let claim = LockClaim::new();
        let (store, ctx, key, request) =
            (Arc::clone(&self.inner), ctx.clone(), key.clone(), claim.clone());
        let op = self.call("acquire_write_lock", OperationKind::Lock, async move {
            store.acquire_claimed(&ctx, &key, &request).await
        });
        match self.run(op).await {
            Err(e @ Error::ClusterTimeout { .. }) if claim.abandon() => Err(e),
            Err(Error::ClusterTimeout { .. }) => Ok(()),
            other => other,
        }
    }

    pub async fn try_acquire_write_lock(
        &self,
        ctx: &LockContext,
        key: &CacheKey,
        timeout: Duration,
    ) -> Result<bool> {
        let claim = LockClaim::new();
        let (store, ctx, key, request) =
            (Arc::clone(&self.inner), ctx.clone(), key.clone(), claim.clone());
        let op = self.call("try_acquire_write_lock", OperationKind::Lock, async move {
            store
                .try_acquire_claimed(&ctx, &key, timeout, &request)
                .await
        });
        match self.run(op).await {
            Err(e @ Error::ClusterTimeout { .. }) if claim.abandon() => Err(e),
            Err(Error::ClusterTimeout { .. }) => Ok(true),
            other => other,
        }
    }

    /// Release one hold
    ///
    /// The local lock stack is updated before the cluster is contacted, so a
    /// timed-out unlock still leaves the caller's hold count correct.
    pub async fn release_write_lock(&self, ctx: &LockContext, key: &CacheKey) -> Result<()> {
        if self.inner.release_local(ctx, key)? != LockRelease::Released {
            return Ok(());
        }

        let (store, ctx, key) = (Arc::clone(&self.inner), ctx.clone(), key.clone());
        let op = self.call("release_write_lock", OperationKind::Lock, async move {
            store.unlock_remote(&ctx, &key).await
        });
        self.run(op).await
    }

    /// Whether `ctx` holds the cluster lock on `key`
    ///
    /// On timeout `no_op` and `local_reads` answer from the local lock stack.
    pub async fn is_write_lock_held(&self, ctx: &LockContext, key: &CacheKey) -> Result<bool> {
        let held_locally = ctx.hold_count(self.inner.name(), key) > 0;
        let (store, ctx, key) = (Arc::clone(&self.inner), ctx.clone(), key.clone());
        let op = self
            .call("is_write_lock_held", OperationKind::LockQuery, async move {
                store.is_write_lock_held(&ctx, &key).await
            })
            .with_local(move || Ok(held_locally));
        self.run(op).await
    }
}

impl std::fmt::Debug for NonstopStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonstopStore")
            .field("inner", &self.inner)
            .field("settings", &self.settings)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
