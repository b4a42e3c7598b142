//! Nonstop: deadline-bounded clustered operations with configurable
//! fallbacks.

mod behavior;
mod executor;
mod store;

pub use behavior::{ClusterCall, ClusterOperation, OperationKind, TimeoutBehavior};
pub use executor::NonstopExecutor;
pub use store::NonstopStore;
