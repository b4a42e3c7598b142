//! Transaction Controller
//!
//! Starts transactions, keeps the decision log and drives commit, rollback
//! and recovery across every participating store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::context::{TransactionContext, TransactionId, TransactionParticipant, TransactionState};
use crate::error::{Error, Result};

/// Default transaction timeout
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome recorded for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    deadline: Instant,
    decision: Decision,
}

/// Counters exposed by the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub timed_out: u64,
    pub recovered: u64,
}

/// Coordinates local transactions
pub struct TransactionController {
    default_timeout: Duration,
    log: DashMap<TransactionId, Record>,
    participants: RwLock<Vec<Weak<dyn TransactionParticipant>>>,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    timed_out: AtomicU64,
    recovered: AtomicU64,
}

impl TransactionController {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            log: DashMap::new(),
            participants: RwLock::new(Vec::new()),
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Begin a transaction with the default timeout
    pub fn begin(&self) -> TransactionContext {
        self.begin_with_timeout(self.default_timeout)
    }

    pub fn begin_with_timeout(&self, timeout: Duration) -> TransactionContext {
        let context = TransactionContext::new(timeout);
        self.log.insert(
            *context.id(),
            Record {
                deadline: context.deadline(),
                decision: Decision::Pending,
            },
        );
        self.begun.fetch_add(1, Ordering::Relaxed);
        debug!(transaction = %context.id(), ?timeout, "Transaction started");
        context
    }

    /// Make a store known to recovery
    pub fn register_participant(&self, participant: Weak<dyn TransactionParticipant>) {
        self.participants.write().push(participant);
    }

    /// Publish every write of `context`
    ///
    /// A transaction past its deadline is rolled back instead and
    /// `TransactionTimeout` is returned.
    #[instrument(skip(self, context), fields(transaction = %context.id()))]
    pub fn commit(&self, context: &TransactionContext) -> Result<()> {
        if context.state() != TransactionState::Active {
            return Err(Error::TransactionInactive(context.id().to_string()));
        }

        if let Err(e) = self.decide(context.id(), Decision::Commit) {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(transaction = %context.id(), "Commit after timeout; rolling back");
            self.finalize(context, Decision::Rollback)?;
            return Err(e);
        }

        let keys = self.finalize(context, Decision::Commit)?;
        self.committed.fetch_add(1, Ordering::Relaxed);
        info!(transaction = %context.id(), keys, "Transaction committed");
        Ok(())
    }

    /// Discard every write of `context`
    #[instrument(skip(self, context), fields(transaction = %context.id()))]
    pub fn rollback(&self, context: &TransactionContext) -> Result<()> {
        if context.state() != TransactionState::Active {
            return Err(Error::TransactionInactive(context.id().to_string()));
        }
        self.force_decision(context.id(), Decision::Rollback);
        let keys = self.finalize(context, Decision::Rollback)?;
        info!(transaction = %context.id(), keys, "Transaction rolled back");
        Ok(())
    }

    /// Whether `transaction` has been decided for commit
    pub fn is_decision_commit(&self, transaction: &TransactionId) -> bool {
        self.log
            .get(transaction)
            .is_some_and(|r| r.decision == Decision::Commit)
    }

    pub fn decision(&self, transaction: &TransactionId) -> Option<Decision> {
        self.log.get(transaction).map(|r| r.decision)
    }

    /// Whether locks of `transaction` may be resolved by someone else
    ///
    /// Unknown transactions are expired. A pending transaction past its
    /// deadline is claimed for rollback as a side effect.
    pub fn is_expired(&self, transaction: &TransactionId) -> bool {
        let Some(mut record) = self.log.get_mut(transaction) else {
            return true;
        };
        if Instant::now() <= record.deadline {
            return false;
        }
        if record.decision == Decision::Pending {
            record.decision = Decision::Rollback;
            self.timed_out.fetch_add(1, Ordering::Relaxed);
            debug!(%transaction, "Expired transaction claimed for rollback");
        }
        true
    }

    /// Resolve soft locks of expired transactions in every live store
    pub fn recover(&self) -> Result<Vec<TransactionId>> {
        let participants: Vec<Arc<dyn TransactionParticipant>> = {
            let mut registered = self.participants.write();
            registered.retain(|p| p.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };

        let mut recovered = Vec::new();
        for participant in participants {
            for transaction in participant.recover()? {
                if !recovered.contains(&transaction) {
                    recovered.push(transaction);
                }
            }
        }
        for transaction in &recovered {
            self.log.remove(transaction);
        }
        if !recovered.is_empty() {
            self.recovered
                .fetch_add(recovered.len() as u64, Ordering::Relaxed);
            info!(count = recovered.len(), "Recovered expired transactions");
        }
        Ok(recovered)
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }

    /// Number of transactions still in the decision log
    pub fn in_flight(&self) -> usize {
        self.log.len()
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Record `decision` unless the deadline passed or rollback was claimed
    fn decide(&self, transaction: &TransactionId, decision: Decision) -> Result<()> {
        let mut record = self
            .log
            .get_mut(transaction)
            .ok_or_else(|| Error::TransactionTimeout(transaction.to_string()))?;
        match record.decision {
            Decision::Pending if Instant::now() <= record.deadline => {
                record.decision = decision;
                Ok(())
            }
            d if d == decision => Ok(()),
            _ => {
                record.decision = Decision::Rollback;
                Err(Error::TransactionTimeout(transaction.to_string()))
            }
        }
    }

    fn force_decision(&self, transaction: &TransactionId, decision: Decision) {
        if let Some(mut record) = self.log.get_mut(transaction) {
            record.decision = decision;
        }
    }

    fn finalize(&self, context: &TransactionContext, decision: Decision) -> Result<usize> {
        let mut keys = 0;
        for participant in context.participants() {
            keys += match decision {
                Decision::Commit => participant.commit(context.id())?,
                _ => participant.rollback(context.id())?,
            };
        }

        let state = match decision {
            Decision::Commit => TransactionState::Committed,
            _ => {
                self.rolled_back.fetch_add(1, Ordering::Relaxed);
                TransactionState::RolledBack
            }
        };
        context.finish(state);
        self.log.remove(context.id());
        Ok(keys)
    }
}

impl Default for TransactionController {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSACTION_TIMEOUT)
    }
}

impl std::fmt::Debug for TransactionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionController")
            .field("default_timeout", &self.default_timeout)
            .field("in_flight", &self.log.len())
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
