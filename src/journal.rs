//! The transaction journal: per-transaction state machine and event ordering.
//!
//! The journal is the only legal interleaving driver. Each relevant
//! transaction moves through `pending ⇄ confirmed` and can only be erased
//! from `pending`; a confirmed transaction must be unconfirmed first. Every
//! entry snapshots the owned-input/owned-output view seen at event time —
//! discovery diffs against that snapshot to compute retroactive deltas
//! without rebuilding history.
//!
//! Confirmed entries are indexed by `(height, confirmation order)` so a
//! reorg can replay them in exact reverse order.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::balance::OwnedView;
use crate::chain::{TxId, TxRecord};

/// Errors from journal transitions. All of them are illegal-transition
/// reports; the engine forwards them without touching state.
#[derive(Clone, Debug, thiserror::Error)]
pub enum JournalError {
    #[error("transaction {0} is not in the journal")]
    NotFound(TxId),
    #[error("transaction {0} is already in the journal")]
    Exists(TxId),
    #[error("transaction {0} is not pending")]
    NotPending(TxId),
    #[error("transaction {0} is not confirmed")]
    NotConfirmed(TxId),
    #[error("transaction {txid} is already confirmed at height {height}")]
    AlreadyConfirmed { txid: TxId, height: u32 },
}

/// Confirmation state of a journal entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Pending,
    Confirmed { height: u32 },
}

impl TxState {
    pub fn height(&self) -> Option<u32> {
        match self {
            TxState::Pending => None,
            TxState::Confirmed { height } => Some(*height),
        }
    }
}

/// One journaled transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub txid: TxId,
    pub tx: TxRecord,
    pub state: TxState,
    /// Ownership snapshot as of the latest event or discovery touching this
    /// entry.
    pub owned: OwnedView,
    /// Wall-clock seconds when the transaction was first journaled. Drives
    /// `zap`.
    pub added_at: u64,
    /// Arrival order, for deterministic iteration of pending entries.
    pub seq: u64,
    /// Order within the confirmed index; reassigned on every confirm.
    confirm_seq: u64,
}

impl JournalEntry {
    pub fn is_pending(&self) -> bool {
        self.state == TxState::Pending
    }

    pub fn height(&self) -> Option<u32> {
        self.state.height()
    }
}

/// The journal proper.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: HashMap<TxId, JournalEntry>,
    confirmed: BTreeMap<(u32, u64), TxId>,
    next_seq: u64,
}

impl Journal {
    pub fn new() -> Self {
        Journal::default()
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &TxId) -> Option<&JournalEntry> {
        self.entries.get(txid)
    }

    pub fn get_mut(&mut self, txid: &TxId) -> Option<&mut JournalEntry> {
        self.entries.get_mut(txid)
    }

    /// Journal a new pending transaction.
    pub fn insert(
        &mut self,
        tx: TxRecord,
        owned: OwnedView,
        added_at: u64,
    ) -> Result<&JournalEntry, JournalError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(JournalError::Exists(txid));
        }
        let seq = self.bump_seq();
        let entry = JournalEntry {
            txid,
            tx,
            state: TxState::Pending,
            owned,
            added_at,
            seq,
            confirm_seq: 0,
        };
        Ok(self.entries.entry(txid).or_insert(entry))
    }

    /// Move a pending entry to confirmed at `height`.
    pub fn set_confirmed(&mut self, txid: &TxId, height: u32) -> Result<(), JournalError> {
        let confirm_seq = self.bump_seq();
        let entry = self
            .entries
            .get_mut(txid)
            .ok_or(JournalError::NotFound(*txid))?;
        if let TxState::Confirmed { height } = entry.state {
            return Err(JournalError::AlreadyConfirmed {
                txid: *txid,
                height,
            });
        }
        entry.state = TxState::Confirmed { height };
        entry.confirm_seq = confirm_seq;
        self.confirmed.insert((height, confirm_seq), *txid);
        Ok(())
    }

    /// Move a confirmed entry back to pending. Returns the height it held.
    pub fn set_pending(&mut self, txid: &TxId) -> Result<u32, JournalError> {
        let entry = self
            .entries
            .get_mut(txid)
            .ok_or(JournalError::NotFound(*txid))?;
        let height = match entry.state {
            TxState::Confirmed { height } => height,
            TxState::Pending => return Err(JournalError::NotConfirmed(*txid)),
        };
        self.confirmed.remove(&(height, entry.confirm_seq));
        entry.state = TxState::Pending;
        entry.confirm_seq = 0;
        Ok(height)
    }

    /// Remove a pending entry. Erasing a confirmed transaction is illegal;
    /// callers must unconfirm first.
    pub fn remove(&mut self, txid: &TxId) -> Result<JournalEntry, JournalError> {
        match self.entries.get(txid) {
            None => Err(JournalError::NotFound(*txid)),
            Some(entry) if !entry.is_pending() => Err(JournalError::NotPending(*txid)),
            Some(_) => Ok(self.entries.remove(txid).unwrap()),
        }
    }

    /// Restore a persisted entry verbatim (open path).
    pub fn restore(&mut self, entry: JournalEntry) {
        self.next_seq = self
            .next_seq
            .max(entry.seq + 1)
            .max(entry.confirm_seq + 1);
        if let TxState::Confirmed { height } = entry.state {
            self.confirmed.insert((height, entry.confirm_seq), entry.txid);
        }
        self.entries.insert(entry.txid, entry);
    }

    /// Confirmed transactions strictly above `height`, in reverse
    /// confirmation order — the reorg replay order.
    pub fn confirmed_above(&self, height: u32) -> Vec<TxId> {
        let Some(floor) = height.checked_add(1) else {
            return Vec::new();
        };
        self.confirmed
            .range((floor, 0)..)
            .rev()
            .map(|(_, txid)| *txid)
            .collect()
    }

    /// Confirmed transactions at or above `height`, in forward order.
    pub fn confirmed_from(&self, height: u32) -> Vec<TxId> {
        self.confirmed
            .range((height, 0)..)
            .map(|(_, txid)| *txid)
            .collect()
    }

    /// Pending entries in arrival order.
    pub fn pending(&self) -> Vec<&JournalEntry> {
        let mut entries: Vec<&JournalEntry> = self
            .entries
            .values()
            .filter(|e| e.is_pending())
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
