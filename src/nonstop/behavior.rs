//! Timeout behaviors and the cluster operation contract

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::statistics::CacheStatistics;

/// What a clustered operation yields once its deadline has passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutBehavior {
    /// Raise `Error::ClusterTimeout`
    #[default]
    Exception,
    /// Return the neutral value (`None`, `false`, `0`, empty)
    NoOp,
    /// Serve reads from the local tiers; mutations act as `NoOp`
    LocalReads,
}

impl TimeoutBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutBehavior::Exception => "exception",
            TimeoutBehavior::NoOp => "no_op",
            TimeoutBehavior::LocalReads => "local_reads",
        }
    }
}

impl FromStr for TimeoutBehavior {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "exception" => Ok(TimeoutBehavior::Exception),
            "no_op" | "noop" => Ok(TimeoutBehavior::NoOp),
            "local_reads" | "localreads" => Ok(TimeoutBehavior::LocalReads),
            _ => Err(Error::UnknownTimeoutBehavior(s.to_string())),
        }
    }
}

impl fmt::Display for TimeoutBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an operation degrades on timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    /// Lock acquire/release: always raises
    Lock,
    /// Lock ownership query: answered from the local lock stack
    LockQuery,
    /// Coherence transitions: always raise
    Coherence,
}

/// A clustered operation run under a deadline
pub trait ClusterOperation: Send {
    type Output: Send + 'static;

    fn name(&self) -> &str;

    /// Start the clustered call; the returned future may outlive the caller
    fn perform_cluster_operation(&mut self) -> BoxFuture<'static, Result<Self::Output>>;

    /// Result to hand back once the deadline has passed
    fn perform_cluster_operation_timed_out(self, behavior: TimeoutBehavior) -> Result<Self::Output>;
}

type LocalFallback<T> = Box<dyn FnOnce() -> Result<T> + Send>;

/// Boxed clustered call with its local fallback
pub struct ClusterCall<T> {
    name: &'static str,
    kind: OperationKind,
    call: Option<BoxFuture<'static, Result<T>>>,
    local: Option<LocalFallback<T>>,
    statistics: Option<Arc<CacheStatistics>>,
}

impl<T> ClusterCall<T>
where
    T: Default + Send + 'static,
{
    pub fn new<F>(name: &'static str, kind: OperationKind, call: F) -> Self
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            name,
            kind,
            call: Some(call.boxed()),
            local: None,
            statistics: None,
        }
    }

    /// Answer used by `local_reads` reads and lock queries
    pub fn with_local<F>(mut self, local: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.local = Some(Box::new(local));
        self
    }

    /// Count timeouts against these statistics
    pub fn with_statistics(mut self, statistics: Arc<CacheStatistics>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl<T> ClusterOperation for ClusterCall<T>
where
    T: Default + Send + 'static,
{
    type Output = T;

    fn name(&self) -> &str {
        self.name
    }

    fn perform_cluster_operation(&mut self) -> BoxFuture<'static, Result<T>> {
        match self.call.take() {
            Some(call) => call,
            None => {
                let name = self.name;
                async move { Err(Error::Internal(format!("{} already started", name))) }.boxed()
            }
        }
    }

    fn perform_cluster_operation_timed_out(self, behavior: TimeoutBehavior) -> Result<T> {
        if let Some(statistics) = &self.statistics {
            statistics.record_cluster_timeout();
        }

        let timeout = || Error::ClusterTimeout {
            operation: self.name.to_string(),
        };
        match (behavior, self.kind) {
            (_, OperationKind::Lock | OperationKind::Coherence) => Err(timeout()),
            (TimeoutBehavior::Exception, _) => Err(timeout()),
            (TimeoutBehavior::LocalReads, OperationKind::Read)
            | (TimeoutBehavior::NoOp | TimeoutBehavior::LocalReads, OperationKind::LockQuery) => {
                match self.local {
                    Some(local) => local(),
                    None => Ok(T::default()),
                }
            }
            _ => Ok(T::default()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
