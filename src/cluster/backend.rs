//! Cluster Backend Port
//!
//! The clustered store talks to the rest of the cluster only through this
//! trait. Every call is made on behalf of one node; lock calls additionally
//! name the holder (a [`LockContext`](super::LockContext) id) on that node.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::element::{CacheKey, Element};

/// Identity of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Owner of a cluster key lock
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub node: NodeId,
    pub holder: u64,
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.holder)
    }
}

/// Shared cluster state as seen from one node
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Node this connection acts for
    fn node_id(&self) -> &NodeId;

    /// Whether the cluster is currently reachable from this node
    fn is_online(&self) -> bool;

    /// Whether every member reports coherent for `cache` (non-blocking)
    fn is_cluster_coherent(&self, cache: &str) -> bool;

    async fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<Element>>;

    /// Store `element`, returning the previous mapping
    async fn put(&self, cache: &str, element: Element) -> Result<Option<Element>>;

    /// Store unless present, returning the existing mapping
    async fn put_if_absent(&self, cache: &str, element: Element) -> Result<Option<Element>>;

    async fn remove(&self, cache: &str, key: &CacheKey) -> Result<Option<Element>>;

    async fn remove_all(&self, cache: &str) -> Result<usize>;

    async fn keys(&self, cache: &str) -> Result<Vec<CacheKey>>;

    async fn size(&self, cache: &str) -> Result<usize>;

    /// Acquire the key lock for `holder`; re-entrant for the same holder
    async fn lock(&self, cache: &str, key: &CacheKey, holder: u64) -> Result<()>;

    /// As [`lock`](Self::lock), giving up after `timeout`
    async fn try_lock(
        &self,
        cache: &str,
        key: &CacheKey,
        holder: u64,
        timeout: Duration,
    ) -> Result<bool>;

    /// Release one hold; `InvalidLockState` if `holder` does not own the lock
    async fn unlock(&self, cache: &str, key: &CacheKey, holder: u64) -> Result<()>;

    async fn is_locked_by(&self, cache: &str, key: &CacheKey, holder: u64) -> Result<bool>;

    /// Publish this node's coherence flag for `cache`
    async fn set_node_coherent(&self, cache: &str, coherent: bool) -> Result<()>;

    /// Resolve once every member reports coherent for `cache`
    async fn wait_until_cluster_coherent(&self, cache: &str) -> Result<()>;
}
