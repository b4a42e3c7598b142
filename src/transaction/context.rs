//! Transaction identity and per-transaction context
//!
//! The context is passed explicitly into every transactional call; there is
//! no ambient "current transaction".

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Globally unique transaction identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a transaction context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// A store that holds soft locks on behalf of transactions
pub trait TransactionParticipant: Send + Sync {
    /// Cache name, used to register each participant once per transaction
    fn participant_name(&self) -> &str;

    /// Publish every value written under `transaction`; returns keys finalized
    fn commit(&self, transaction: &TransactionId) -> Result<usize>;

    /// Restore every value written under `transaction`; returns keys finalized
    fn rollback(&self, transaction: &TransactionId) -> Result<usize>;

    /// Resolve soft locks left behind by expired transactions
    fn recover(&self) -> Result<Vec<TransactionId>>;
}

/// State of one in-flight transaction
pub struct TransactionContext {
    id: TransactionId,
    started: Instant,
    deadline: Instant,
    locked_anything: AtomicBool,
    participants: Mutex<Vec<Arc<dyn TransactionParticipant>>>,
    state: Mutex<TransactionState>,
}

impl TransactionContext {
    pub(crate) fn new(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            id: TransactionId::new(),
            started,
            deadline: started + timeout,
            locked_anything: AtomicBool::new(false),
            participants: Mutex::new(Vec::new()),
            state: Mutex::new(TransactionState::Active),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn timed_out(&self) -> bool {
        Instant::now() > self.deadline
    }

    /// Time left before the deadline (zero once past it)
    pub fn time_before_timeout(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether this transaction holds at least one soft lock
    pub fn has_locked_anything(&self) -> bool {
        self.locked_anything.load(Ordering::Acquire)
    }

    /// Fail unless the transaction is active and within its deadline
    pub fn ensure_usable(&self) -> Result<()> {
        if self.state() != TransactionState::Active {
            return Err(Error::TransactionInactive(self.id.to_string()));
        }
        if self.timed_out() {
            return Err(Error::TransactionTimeout(self.id.to_string()));
        }
        Ok(())
    }

    /// Record that `participant` now holds a soft lock for this transaction
    pub(crate) fn register(&self, participant: Arc<dyn TransactionParticipant>) {
        self.locked_anything.store(true, Ordering::Release);
        let mut participants = self.participants.lock();
        if !participants
            .iter()
            .any(|p| p.participant_name() == participant.participant_name())
        {
            participants.push(participant);
        }
    }

    pub(crate) fn participants(&self) -> Vec<Arc<dyn TransactionParticipant>> {
        self.participants.lock().clone()
    }

    /// Move from active to `next`; false if already finished
    pub(crate) fn finish(&self, next: TransactionState) -> bool {
        let mut state = self.state.lock();
        if *state != TransactionState::Active {
            return false;
        }
        *state = next;
        true
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("locked_anything", &self.has_locked_anything())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_ids_are_unique() {
        assert_ne!(TransactionId::new(), TransactionId::new());
    }

    #[test]
    fn test_context_deadline() {
        let ctx = TransactionContext::new(Duration::from_millis(20));
        assert!(ctx.ensure_usable().is_ok());
        assert!(ctx.time_before_timeout() <= Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(40));
        assert!(ctx.timed_out());
        assert_eq!(ctx.time_before_timeout(), Duration::ZERO);
        assert!(matches!(ctx.ensure_usable(), Err(Error::TransactionTimeout(_))));
    }

    #[test]
    fn test_finish_only_once() {
        let ctx = TransactionContext::new(Duration::from_secs(5));
        assert!(ctx.finish(TransactionState::Committed));
        assert!(!ctx.finish(TransactionState::RolledBack));
        assert_eq!(ctx.state(), TransactionState::Committed);
        assert!(matches!(ctx.ensure_usable(), Err(Error::TransactionInactive(_))));
    }
}
