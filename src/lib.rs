//! Stratacache - Tiered Cache Engine
//!
//! An in-process cache that keeps elements in up to three capacity-bounded
//! tiers (heap, off-heap, disk), evicts with sampled LRU/LFU/FIFO/CLOCK
//! policies, isolates local transactions through soft locks and shares
//! caches across a cluster with nonstop timeouts.
//!
//! # Architecture
//!
//! ```text
//! Cache ──────────────► LocalTransactionStore ─► TieredStore ─► heap │ off-heap │ disk
//!                                                    ▲
//! ClusteredCache ─► NonstopStore ─► CoherentClusteredStore ─► ClusterBackend
//! ```
//!
//! # Modules
//!
//! - [`store`] - Elements, tiers, eviction policies and the tiered store
//! - [`transaction`] - Soft locks and local transactions
//! - [`cluster`] - Cluster backend port, in-memory cluster, coherent store
//! - [`nonstop`] - Deadline-bounded clustered operations
//! - [`event`] - Cache events and listeners
//! - [`statistics`] - Counters, snapshots and Prometheus export
//! - [`config`] - YAML configuration
//! - [`cache`] / [`manager`] - Named caches and their owner

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod nonstop;
pub mod statistics;
pub mod store;
pub mod transaction;

// Re-export commonly used types
pub use cache::{Cache, ClusteredCache};
pub use cluster::{ClusterBackend, Consistency, InMemoryCluster, LockContext, NodeId};
pub use config::{CacheConfig, CacheManagerConfig, NonstopConfig};
pub use error::{Error, Result};
pub use event::{CacheEvent, CacheEventListener, InMemoryEventCollector, LoggingListener};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use nonstop::TimeoutBehavior;
pub use statistics::{CacheStatistics, PrometheusExporter, StatisticsSnapshot};
pub use store::{CacheKey, Element, EvictionPolicyKind, TierCapacity, TierKind, TieredStore};
pub use transaction::{TransactionContext, TransactionController, TransactionId};
