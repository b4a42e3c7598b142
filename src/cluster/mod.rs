//! Clustered storage: the backend port, an in-process cluster, explicit key
//! locks and the coherent clustered store.

pub mod backend;
pub mod coherent;
pub mod lock;
pub mod memory;

pub use backend::{ClusterBackend, LockOwner, NodeId};
pub use coherent::{CoherentClusteredStore, Consistency};
pub use lock::{LockContext, LockRelease};
pub(crate) use lock::LockClaim;
pub use memory::{InMemoryCluster, NodeConnection};
