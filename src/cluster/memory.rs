//! In-Memory Cluster
//!
//! A process-local stand-in for a cluster. Every node joins the same shared
//! state and gets its own [`NodeConnection`]; per-node latency and
//! reachability can be changed at runtime to exercise timeout handling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

use super::backend::{ClusterBackend, LockOwner, NodeId};
use crate::error::{Error, Result};
use crate::store::element::{CacheKey, Element};

#[derive(Debug, Clone, Copy)]
struct NodeHealth {
    online: bool,
    latency: Duration,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            online: true,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct SharedCache {
    data: DashMap<CacheKey, Element>,
    locks: Mutex<HashMap<CacheKey, (LockOwner, u32)>>,
    released: Notify,
    incoherent: Mutex<HashSet<NodeId>>,
}

impl SharedCache {
    fn try_acquire(&self, key: &CacheKey, owner: &LockOwner) -> bool {
        let mut locks = self.locks.lock();
        if let Some((holder, count)) = locks.get_mut(key) {
            if *holder != *owner {
                return false;
            }
            *count += 1;
            return true;
        }
        locks.insert(key.clone(), (owner.clone(), 1));
        true
    }

    fn release(&self, key: &CacheKey, owner: &LockOwner) -> Result<()> {
        let mut locks = self.locks.lock();
        let now_free = match locks.get_mut(key) {
            Some((holder, count)) if *holder == *owner => {
                *count -= 1;
                *count == 0
            }
            Some((holder, _)) => {
                return Err(Error::InvalidLockState {
                    key: key.to_string(),
                    reason: format!("held by {}, not {}", holder, owner),
                })
            }
            None => {
                return Err(Error::InvalidLockState {
                    key: key.to_string(),
                    reason: format!("not locked, {} has nothing to release", owner),
                })
            }
        };
        if now_free {
            locks.remove(key);
            drop(locks);
            self.released.notify_waiters();
        }
        Ok(())
    }
}

struct ClusterState {
    caches: DashMap<String, Arc<SharedCache>>,
    nodes: DashMap<NodeId, NodeHealth>,
    reachability: watch::Sender<u64>,
    coherence: watch::Sender<u64>,
}

impl ClusterState {
    fn cache(&self, name: &str) -> Arc<SharedCache> {
        Arc::clone(self.caches.entry(name.to_string()).or_default().value())
    }

    fn health(&self, node: &NodeId) -> NodeHealth {
        self.nodes.get(node).map(|h| *h).unwrap_or_default()
    }
}

/// Shared fake cluster; clones refer to the same state
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let (reachability, _) = watch::channel(0);
        let (coherence, _) = watch::channel(0);
        Self {
            state: Arc::new(ClusterState {
                caches: DashMap::new(),
                nodes: DashMap::new(),
                reachability,
                coherence,
            }),
        }
    }

    /// Connect `node` to the cluster
    pub fn join(&self, node: impl Into<NodeId>) -> Arc<NodeConnection> {
        let node = node.into();
        self.state.nodes.entry(node.clone()).or_default();
        debug!(%node, "Node joined in-memory cluster");
        Arc::new(NodeConnection {
            node,
            state: Arc::clone(&self.state),
        })
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.state.nodes.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    /// Delay every call made by `node`
    pub fn set_latency(&self, node: &NodeId, latency: Duration) {
        self.state.nodes.entry(node.clone()).or_default().latency = latency;
    }

    /// Partition `node` away (calls hang) or heal it
    pub fn set_online(&self, node: &NodeId, online: bool) {
        self.state.nodes.entry(node.clone()).or_default().online = online;
        self.state.reachability.send_modify(|generation| *generation += 1);
        info!(%node, online, "Node reachability changed");
    }

    /// Simulate `node` leaving and rejoining: every lock it held is lost
    pub fn rejoin(&self, node: &NodeId) -> usize {
        let mut dropped = 0;
        for cache in self.state.caches.iter() {
            let mut locks = cache.locks.lock();
            let before = locks.len();
            locks.retain(|_, (owner, _)| owner.node != *node);
            dropped += before - locks.len();
            drop(locks);
            cache.released.notify_waiters();
        }
        info!(%node, dropped, "Node rejoined; locks cleared");
        dropped
    }

    /// Locks currently owned by any holder on `node`
    pub fn locks_held_by(&self, node: &NodeId) -> usize {
        self.state
            .caches
            .iter()
            .map(|cache| {
                cache
                    .locks
                    .lock()
                    .values()
                    .filter(|(owner, _)| owner.node == *node)
                    .count()
            })
            .sum()
    }

    /// Entries stored cluster-side for `cache`
    pub fn entries(&self, cache: &str) -> usize {
        self.state.cache(cache).data.len()
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCluster")
            .field("nodes", &self.nodes())
            .field("caches", &self.state.caches.len())
            .finish()
    }
}

/// One node's view of an [`InMemoryCluster`]
pub struct NodeConnection {
    node: NodeId,
    state: Arc<ClusterState>,
}

impl NodeConnection {
    fn owner(&self, holder: u64) -> LockOwner {
        LockOwner {
            node: self.node.clone(),
            holder,
        }
    }

    /// Wait for reachability, then pay the configured latency
    async fn round_trip(&self) {
        let mut reachability = self.state.reachability.subscribe();
        loop {
            let health = self.state.health(&self.node);
            if health.online {
                if !health.latency.is_zero() {
                    tokio::time::sleep(health.latency).await;
                }
                return;
            }
            if reachability.changed().await.is_err() {
                return;
            }
        }
    }

    async fn acquire(&self, shared: &SharedCache, key: &CacheKey, owner: &LockOwner) {
        loop {
            let released = shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if shared.try_acquire(key, owner) {
                return;
            }
            released.await;
        }
    }
}

#[async_trait]
impl ClusterBackend for NodeConnection {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    fn is_online(&self) -> bool {
        self.state.health(&self.node).online
    }

    fn is_cluster_coherent(&self, cache: &str) -> bool {
        self.state.cache(cache).incoherent.lock().is_empty()
    }

    async fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<Element>> {
        self.round_trip().await;
        Ok(self.state.cache(cache).data.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, cache: &str, element: Element) -> Result<Option<Element>> {
        self.round_trip().await;
        let key = element.key().clone();
        Ok(self.state.cache(cache).data.insert(key, element))
    }

    async fn put_if_absent(&self, cache: &str, element: Element) -> Result<Option<Element>> {
        self.round_trip().await;
        let shared = self.state.cache(cache);
        let existing = match shared.data.entry(element.key().clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => Some(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(element);
                None
            }
        };
        Ok(existing)
    }

    async fn remove(&self, cache: &str, key: &CacheKey) -> Result<Option<Element>> {
        self.round_trip().await;
        Ok(self.state.cache(cache).data.remove(key).map(|(_, e)| e))
    }

    async fn remove_all(&self, cache: &str) -> Result<usize> {
        self.round_trip().await;
        let shared = self.state.cache(cache);
        let removed = shared.data.len();
        shared.data.clear();
        Ok(removed)
    }

    async fn keys(&self, cache: &str) -> Result<Vec<CacheKey>> {
        self.round_trip().await;
        Ok(self
            .state
            .cache(cache)
            .data
            .iter()
            .map(|e| e.key().clone())
            .collect())
    }

    async fn size(&self, cache: &str) -> Result<usize> {
        self.round_trip().await;
        Ok(self.state.cache(cache).data.len())
    }

    async fn lock(&self, cache: &str, key: &CacheKey, holder: u64) -> Result<()> {
        self.round_trip().await;
        let shared = self.state.cache(cache);
        self.acquire(&shared, key, &self.owner(holder)).await;
        Ok(())
    }

    async fn try_lock(
        &self,
        cache: &str,
        key: &CacheKey,
        holder: u64,
        timeout: Duration,
    ) -> Result<bool> {
        match tokio::time::timeout(timeout, self.lock(cache, key, holder)).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    async fn unlock(&self, cache: &str, key: &CacheKey, holder: u64) -> Result<()> {
        self.round_trip().await;
        self.state.cache(cache).release(key, &self.owner(holder))
    }

    async fn is_locked_by(&self, cache: &str, key: &CacheKey, holder: u64) -> Result<bool> {
        self.round_trip().await;
        let owner = self.owner(holder);
        Ok(self
            .state
            .cache(cache)
            .locks
            .lock()
            .get(key)
            .is_some_and(|(held_by, _)| *held_by == owner))
    }

    async fn set_node_coherent(&self, cache: &str, coherent: bool) -> Result<()> {
        self.round_trip().await;
        {
            let shared = self.state.cache(cache);
            let mut incoherent = shared.incoherent.lock();
            if coherent {
                incoherent.remove(&self.node);
            } else {
                incoherent.insert(self.node.clone());
            }
        }
        self.state.coherence.send_modify(|generation| *generation += 1);
        Ok(())
    }

    async fn wait_until_cluster_coherent(&self, cache: &str) -> Result<()> {
        let mut changes = self.state.coherence.subscribe();
        loop {
            if self.is_cluster_coherent(cache) {
                return Ok(());
            }
            changes
                .changed()
                .await
                .map_err(|_| Error::Cluster("cluster state dropped".to_string()))?;
        }
    }
}

impl std::fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnection").field("node", &self.node).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_data_is_shared_between_nodes() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("a");
        let b = cluster.join("b");

        a.put("c", Element::new("k", "v")).await.unwrap();
        let seen = b.get("c", &CacheKey::new("k")).await.unwrap().unwrap();
        assert_eq!(seen.value().unwrap().as_ref(), b"v");
        assert_eq!(cluster.entries("c"), 1);

        let existing = b.put_if_absent("c", Element::new("k", "w")).await.unwrap();
        assert!(existing.is_some());
        assert_eq!(b.remove_all("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lock_excludes_other_holders() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("a");
        let b = cluster.join("b");
        let key = CacheKey::new("k");

        a.lock("c", &key, 1).await.unwrap();
        a.lock("c", &key, 1).await.unwrap();
        assert!(!b.try_lock("c", &key, 2, Duration::from_millis(20)).await.unwrap());
        assert!(!a.try_lock("c", &key, 3, Duration::from_millis(20)).await.unwrap());

        a.unlock("c", &key, 1).await.unwrap();
        assert!(a.is_locked_by("c", &key, 1).await.unwrap());
        a.unlock("c", &key, 1).await.unwrap();
        assert!(b.try_lock("c", &key, 2, Duration::from_millis(20)).await.unwrap());

        let err = a.unlock("c", &key, 1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidLockState { .. }));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("a");
        let b = cluster.join("b");
        let key = CacheKey::new("k");

        a.lock("c", &key, 1).await.unwrap();
        let waiter = {
            let b = Arc::clone(&b);
            let key = key.clone();
            tokio::spawn(async move { b.lock("c", &key, 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.unlock("c", &key, 1).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(b.is_locked_by("c", &key, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejoin_drops_locks() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("a");
        a.lock("c", &CacheKey::new("x"), 1).await.unwrap();
        a.lock("c", &CacheKey::new("y"), 1).await.unwrap();
        assert_eq!(cluster.locks_held_by(a.node_id()), 2);

        assert_eq!(cluster.rejoin(a.node_id()), 2);
        assert_eq!(cluster.locks_held_by(a.node_id()), 0);
    }

    #[tokio::test]
    async fn test_offline_node_blocks_until_healed() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("a");
        cluster.set_online(a.node_id(), false);
        assert!(!a.is_online());

        let call = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.size("c").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!call.is_finished());

        cluster.set_online(a.node_id(), true);
        let size = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn test_coherence_barrier() {
        let cluster = InMemoryCluster::new();
        let a = cluster.join("a");
        let b = cluster.join("b");

        a.set_node_coherent("c", false).await.unwrap();
        b.set_node_coherent("c", false).await.unwrap();
        assert!(!a.is_cluster_coherent("c"));

        let barrier = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.wait_until_cluster_coherent("c").await })
        };
        a.set_node_coherent("c", true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!barrier.is_finished());

        b.set_node_coherent("c", true).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), barrier)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(b.is_cluster_coherent("c"));
    }
}
