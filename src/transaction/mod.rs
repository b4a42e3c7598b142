//! Local transactions over soft locks
//!
//! Writes made inside a transaction are parked in the store as soft-lock
//! shadows until the [`TransactionController`] commits or rolls them back.

pub mod context;
pub mod controller;
pub mod manager;
pub mod soft_lock;
pub mod store;

pub use context::{TransactionContext, TransactionId, TransactionParticipant, TransactionState};
pub use controller::{Decision, TransactionController, TransactionStats, DEFAULT_TRANSACTION_TIMEOUT};
pub use manager::SoftLockManager;
pub use soft_lock::{SoftLock, SoftLockId};
pub use store::LocalTransactionStore;
