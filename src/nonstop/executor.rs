//! Nonstop Executor
//!
//! Runs clustered operations as tokio tasks under a deadline. When the
//! deadline passes the task is abandoned: it keeps running to completion
//! but its result is dropped, and the operation's timeout fallback is
//! returned instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::time::timeout;
use tracing::{debug, warn};

use super::behavior::ClusterOperation;
use crate::config::NonstopSettings;
use crate::error::{Error, Result};

/// Shared executor for every clustered cache of a manager
#[derive(Debug, Default)]
pub struct NonstopExecutor {
    executed: AtomicU64,
    timed_out: AtomicU64,
}

impl NonstopExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` within its deadline, falling back per `settings` on timeout
    pub async fn execute_cluster_operation<Op>(
        &self,
        mut op: Op,
        settings: &NonstopSettings,
    ) -> Result<Op::Output>
    where
        Op: ClusterOperation,
    {
        self.executed.fetch_add(1, Ordering::Relaxed);
        let call = op.perform_cluster_operation();
        if !settings.enabled {
            return call.await;
        }

        let deadline = settings.timeout_for(op.name());
        let started = Instant::now();
        match timeout(deadline, tokio::spawn(call)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(Error::Internal(format!(
                "cluster operation {} failed: {}",
                op.name(),
                join_error
            ))),
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    operation = op.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    behavior = %settings.behavior,
                    "Cluster operation timed out"
                );
                op.perform_cluster_operation_timed_out(settings.behavior)
            }
        }
    }

    /// Apply the timeout fallback without contacting the cluster
    pub fn timed_out_immediately<Op>(&self, op: Op, settings: &NonstopSettings) -> Result<Op::Output>
    where
        Op: ClusterOperation,
    {
        self.executed.fetch_add(1, Ordering::Relaxed);
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        debug!(operation = op.name(), "Cluster offline, immediate timeout");
        op.perform_cluster_operation_timed_out(settings.behavior)
    }

    /// Operations started
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Operations that hit their deadline
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
