//! Transaction cache entries and staged transitions
//!
//! A [`TransactionMetadata`] is one entry of the transaction metadata cache.
//! State changes are never applied directly: a caller stages a
//! [`TxnTransitMetadata`] describing the proposed transition, appends it to
//! the transaction log, and only after the append is acknowledged completes
//! the transition in place under the entry's lock.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;

use crate::error::{CoordinatorError, Result};
use crate::types::TopicPartition;

/// Transaction state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TxnState {
    Empty,
    Ongoing,
    PrepareCommit,
    PrepareAbort,
    CompleteCommit,
    CompleteAbort,
    Dead,
}

impl TxnState {
    pub fn byte(self) -> i8 {
        match self {
            TxnState::Empty => 0,
            TxnState::Ongoing => 1,
            TxnState::PrepareCommit => 2,
            TxnState::PrepareAbort => 3,
            TxnState::CompleteCommit => 4,
            TxnState::CompleteAbort => 5,
            TxnState::Dead => 6,
        }
    }

    pub fn from_byte(b: i8) -> Option<Self> {
        Some(match b {
            0 => TxnState::Empty,
            1 => TxnState::Ongoing,
            2 => TxnState::PrepareCommit,
            3 => TxnState::PrepareAbort,
            4 => TxnState::CompleteCommit,
            5 => TxnState::CompleteAbort,
            6 => TxnState::Dead,
            _ => return None,
        })
    }

    /// States a transition into `self` may legally come from.
    pub fn valid_previous_states(self) -> &'static [TxnState] {
        match self {
            TxnState::Empty => &[TxnState::Empty, TxnState::CompleteCommit, TxnState::CompleteAbort],
            TxnState::Ongoing => &[
                TxnState::Ongoing,
                TxnState::Empty,
                TxnState::CompleteCommit,
                TxnState::CompleteAbort,
            ],
            TxnState::PrepareCommit => &[TxnState::Ongoing],
            TxnState::PrepareAbort => &[TxnState::Ongoing],
            TxnState::CompleteCommit => &[TxnState::PrepareCommit],
            TxnState::CompleteAbort => &[TxnState::PrepareAbort],
            TxnState::Dead => &[TxnState::Empty, TxnState::CompleteCommit, TxnState::CompleteAbort],
        }
    }

    pub fn is_preparing(self) -> bool {
        matches!(self, TxnState::PrepareCommit | TxnState::PrepareAbort)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnState::Empty => "Empty",
            TxnState::Ongoing => "Ongoing",
            TxnState::PrepareCommit => "PrepareCommit",
            TxnState::PrepareAbort => "PrepareAbort",
            TxnState::CompleteCommit => "CompleteCommit",
            TxnState::CompleteAbort => "CompleteAbort",
            TxnState::Dead => "Dead",
        };
        f.write_str(s)
    }
}

/// Outcome a set of transaction markers carries to the data partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionResult {
    Commit,
    Abort,
}

/// The delta describing one proposed transition, separate from the committed
/// state it will be applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnTransitMetadata {
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub txn_timeout_ms: i32,
    pub txn_state: TxnState,
    pub topic_partitions: HashSet<TopicPartition>,
    pub txn_start_timestamp: i64,
    pub txn_last_update_timestamp: i64,
}

/// Mutable state of a transaction entry. All access goes through
/// [`TransactionMetadata::in_lock`].
#[derive(Debug)]
pub struct TxnInner {
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub txn_timeout_ms: i32,
    pub state: TxnState,
    /// Staged next state, promoted only after a successful log append.
    pub pending_state: Option<TxnState>,
    pub topic_partitions: HashSet<TopicPartition>,
    pub txn_start_timestamp: i64,
    pub txn_last_update_timestamp: i64,
}

impl TxnInner {
    fn transit_to(&self, new_state: TxnState, partitions: HashSet<TopicPartition>, now: i64) -> TxnTransitMetadata {
        TxnTransitMetadata {
            producer_id: self.producer_id,
            producer_epoch: self.producer_epoch,
            txn_timeout_ms: self.txn_timeout_ms,
            txn_state: new_state,
            topic_partitions: partitions,
            txn_start_timestamp: self.txn_start_timestamp,
            txn_last_update_timestamp: now,
        }
    }

    /// Stage a transition to `new_state`, validating it against the current
    /// state and the pending slot.
    pub fn prepare_transition_to(
        &mut self,
        new_state: TxnState,
        partitions: HashSet<TopicPartition>,
        now: i64,
    ) -> Result<TxnTransitMetadata> {
        if self.pending_state.is_some() {
            return Err(CoordinatorError::InvalidTxnState(format!(
                "cannot stage transition to {} while {} is already pending",
                new_state,
                self.pending_state.map(|s| s.to_string()).unwrap_or_default()
            )));
        }
        if !new_state.valid_previous_states().contains(&self.state) {
            return Err(CoordinatorError::InvalidTxnState(format!(
                "transition from {} to {} is not allowed",
                self.state, new_state
            )));
        }
        self.pending_state = Some(new_state);
        Ok(self.transit_to(new_state, partitions, now))
    }

    /// Stage the transition of an ongoing transaction to a preparing state.
    pub fn prepare_abort_or_commit(&mut self, new_state: TxnState, now: i64) -> Result<TxnTransitMetadata> {
        debug_assert!(new_state.is_preparing());
        let partitions = self.topic_partitions.clone();
        self.prepare_transition_to(new_state, partitions, now)
    }

    /// Stage the completion of a preparing transaction. Participating
    /// partitions are cleared once the markers are on their way.
    pub fn prepare_complete(&mut self, now: i64) -> Result<TxnTransitMetadata> {
        let new_state = match self.state {
            TxnState::PrepareCommit => TxnState::CompleteCommit,
            TxnState::PrepareAbort => TxnState::CompleteAbort,
            other => {
                return Err(CoordinatorError::InvalidTxnState(format!(
                    "cannot complete a transaction in state {other}"
                )))
            }
        };
        self.prepare_transition_to(new_state, HashSet::new(), now)
    }

    /// Stage adding partitions to an ongoing (or not yet started) transaction.
    pub fn prepare_add_partitions(
        &mut self,
        partitions: impl IntoIterator<Item = TopicPartition>,
        now: i64,
    ) -> Result<TxnTransitMetadata> {
        let mut merged = self.topic_partitions.clone();
        merged.extend(partitions);
        // a transaction entering Ongoing from Empty starts its clock now
        let start = if self.state == TxnState::Empty {
            now
        } else {
            self.txn_start_timestamp
        };
        let mut transit = self.prepare_transition_to(TxnState::Ongoing, merged, now)?;
        transit.txn_start_timestamp = start;
        Ok(transit)
    }

    /// Apply an acknowledged transition in place. The staged pending state
    /// must match the transit being completed.
    pub fn complete_transition_to(&mut self, transit: &TxnTransitMetadata) -> Result<()> {
        match self.pending_state {
            Some(pending) if pending == transit.txn_state => {
                self.producer_id = transit.producer_id;
                self.producer_epoch = transit.producer_epoch;
                self.txn_timeout_ms = transit.txn_timeout_ms;
                self.state = transit.txn_state;
                self.topic_partitions = transit.topic_partitions.clone();
                self.txn_start_timestamp = transit.txn_start_timestamp;
                self.txn_last_update_timestamp = transit.txn_last_update_timestamp;
                self.pending_state = None;
                Ok(())
            }
            Some(pending) => Err(CoordinatorError::InvalidTxnState(format!(
                "completing transition to {} but {} is pending",
                transit.txn_state, pending
            ))),
            None => Err(CoordinatorError::InvalidTxnState(format!(
                "completing transition to {} with no pending state",
                transit.txn_state
            ))),
        }
    }
}

/// One entry of the transaction metadata cache.
pub struct TransactionMetadata {
    transactional_id: String,
    inner: Mutex<TxnInner>,
}

impl TransactionMetadata {
    pub fn new(
        transactional_id: impl Into<String>,
        producer_id: i64,
        producer_epoch: i16,
        txn_timeout_ms: i32,
        state: TxnState,
        now: i64,
    ) -> Self {
        Self {
            transactional_id: transactional_id.into(),
            inner: Mutex::new(TxnInner {
                producer_id,
                producer_epoch,
                txn_timeout_ms,
                state,
                pending_state: None,
                topic_partitions: HashSet::new(),
                txn_start_timestamp: now,
                txn_last_update_timestamp: now,
            }),
        }
    }

    /// Rebuild an entry from a decoded log record.
    pub fn loaded(
        transactional_id: impl Into<String>,
        producer_id: i64,
        producer_epoch: i16,
        txn_timeout_ms: i32,
        state: TxnState,
        topic_partitions: HashSet<TopicPartition>,
        txn_start_timestamp: i64,
        txn_last_update_timestamp: i64,
    ) -> Self {
        Self {
            transactional_id: transactional_id.into(),
            inner: Mutex::new(TxnInner {
                producer_id,
                producer_epoch,
                txn_timeout_ms,
                state,
                pending_state: None,
                topic_partitions,
                txn_start_timestamp,
                txn_last_update_timestamp,
            }),
        }
    }

    pub fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    /// Run `f` under this entry's lock.
    pub fn in_lock<T>(&self, f: impl FnOnce(&mut TxnInner) -> T) -> T {
        f(&mut self.inner.lock())
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    pub fn pending_state(&self) -> Option<TxnState> {
        self.inner.lock().pending_state
    }

    pub fn producer_id(&self) -> i64 {
        self.inner.lock().producer_id
    }

    pub fn producer_epoch(&self) -> i16 {
        self.inner.lock().producer_epoch
    }
}

impl fmt::Debug for TransactionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TransactionMetadata")
            .field("transactional_id", &self.transactional_id)
            .field("producer_id", &inner.producer_id)
            .field("producer_epoch", &inner.producer_epoch)
            .field("state", &inner.state)
            .field("pending_state", &inner.pending_state)
            .field("partitions", &inner.topic_partitions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ongoing(now: i64) -> TransactionMetadata {
        let txn = TransactionMetadata::new("t", 1000, 0, 60_000, TxnState::Empty, now);
        txn.in_lock(|m| {
            let transit = m
                .prepare_add_partitions([TopicPartition::new("orders", 0)], now)
                .unwrap();
            m.complete_transition_to(&transit).unwrap();
        });
        txn
    }

    #[test]
    fn commit_happy_path() {
        let txn = ongoing(100);
        let transit = txn
            .in_lock(|m| m.prepare_abort_or_commit(TxnState::PrepareCommit, 200))
            .unwrap();
        assert_eq!(txn.pending_state(), Some(TxnState::PrepareCommit));

        txn.in_lock(|m| m.complete_transition_to(&transit)).unwrap();
        assert_eq!(txn.state(), TxnState::PrepareCommit);
        assert_eq!(txn.pending_state(), None);

        let complete = txn.in_lock(|m| m.prepare_complete(300)).unwrap();
        assert_eq!(complete.txn_state, TxnState::CompleteCommit);
        assert!(complete.topic_partitions.is_empty());
        txn.in_lock(|m| m.complete_transition_to(&complete)).unwrap();
        assert_eq!(txn.state(), TxnState::CompleteCommit);
    }

    #[test]
    fn double_staging_is_rejected() {
        let txn = ongoing(100);
        txn.in_lock(|m| m.prepare_abort_or_commit(TxnState::PrepareAbort, 200))
            .unwrap();
        let err = txn
            .in_lock(|m| m.prepare_abort_or_commit(TxnState::PrepareCommit, 201))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidTxnState(_)));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let txn = TransactionMetadata::new("t", 1000, 0, 60_000, TxnState::Empty, 0);
        let err = txn.in_lock(|m| m.prepare_complete(10)).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidTxnState(_)));
    }

    #[test]
    fn complete_requires_matching_pending_state() {
        let txn = ongoing(100);
        let transit = txn
            .in_lock(|m| m.prepare_abort_or_commit(TxnState::PrepareCommit, 200))
            .unwrap();
        let mut wrong = transit.clone();
        wrong.txn_state = TxnState::CompleteAbort;
        let err = txn
            .in_lock(|m| m.complete_transition_to(&wrong))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidTxnState(_)));

        // The staged transition still applies.
        txn.in_lock(|m| m.complete_transition_to(&transit)).unwrap();
        assert_eq!(txn.state(), TxnState::PrepareCommit);
    }

    #[test]
    fn state_byte_round_trip() {
        for state in [
            TxnState::Empty,
            TxnState::Ongoing,
            TxnState::PrepareCommit,
            TxnState::PrepareAbort,
            TxnState::CompleteCommit,
            TxnState::CompleteAbort,
            TxnState::Dead,
        ] {
            assert_eq!(TxnState::from_byte(state.byte()), Some(state));
        }
        assert_eq!(TxnState::from_byte(7), None);
    }
}
