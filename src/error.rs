//! Error types for the stratacache engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by cache operations
///
/// Capacity pressure never appears here: tiers resolve it internally by
/// evicting. Broken internal invariants panic instead of returning an error.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown eviction policy name
    #[error("Unknown eviction policy: {0}")]
    UnknownEvictionPolicy(String),

    /// Unknown timeout behavior name
    #[error("Unknown timeout behavior: {0}")]
    UnknownTimeoutBehavior(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Cache not found in the manager
    #[error("Cache not found: {0}")]
    CacheNotFound(String),

    /// Cache name already registered
    #[error("Cache already exists: {0}")]
    CacheAlreadyExists(String),

    /// Cache manager has been shut down
    #[error("Cache manager is shut down")]
    Shutdown,

    // =========================================================================
    // Locking Errors
    // =========================================================================
    /// Per-key lock not acquired in time (retryable)
    #[error("Timed out after {timeout:?} acquiring lock on key {key}")]
    LockTimeout { key: String, timeout: Duration },

    /// Lock bookkeeping inconsistent with the cluster view (e.g. after rejoin)
    #[error("Invalid lock state for key {key}: {reason}")]
    InvalidLockState { key: String, reason: String },

    // =========================================================================
    // Cluster Errors
    // =========================================================================
    /// Clustered operation exceeded its nonstop deadline
    #[error("Cluster operation '{operation}' timed out")]
    ClusterTimeout { operation: String },

    /// Cluster backend failure
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Clustered operation requested on a non-clustered cache
    #[error("Cache {0} is not clustered")]
    NotClustered(String),

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    /// Write attempted on a transactional cache without a transaction
    #[error("Cache {0} is transactional: writes require a transaction context")]
    TransactionRequired(String),

    /// Transaction ran past its deadline
    #[error("Transaction {0} timed out")]
    TransactionTimeout(String),

    /// Two transactions wait on each other's soft locks
    #[error("Deadlock detected on key {key} between transaction {current} and {foreign}")]
    Deadlock {
        key: String,
        current: String,
        foreign: String,
    },

    /// Transactional operation requested on a plain cache
    #[error("Cache {0} is not transactional")]
    NotTransactional(String),

    /// Transaction already committed or rolled back
    #[error("Transaction {0} is no longer active")]
    TransactionInactive(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. } | Error::ClusterTimeout { .. } | Error::Deadlock { .. }
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
