//! The credit store: one record per owned transaction output.
//!
//! Credits are keyed by outpoint in a flat map, with a per-account secondary
//! index kept in lockstep for scoped iteration. The spending transaction is
//! referenced by id only — the journal owns transaction records, the credit
//! store owns output records, and neither holds a pointer into the other.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::account::{AccountId, KeyPath};
use crate::chain::{Outpoint, TxId};
use crate::covenant::CovenantClass;

/// A wallet-local record of an owned output.
///
/// Invariants maintained by the engine:
/// - `spent_by = Some(t)` only while `t` is present in the journal
/// - `height.is_some()` iff the creating transaction is confirmed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub outpoint: Outpoint,
    pub value: u64,
    pub path: KeyPath,
    pub class: CovenantClass,
    pub spent_by: Option<TxId>,
    pub height: Option<u32>,
    pub coinbase: bool,
}

impl Credit {
    pub fn is_spent(&self) -> bool {
        self.spent_by.is_some()
    }

    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }
}

/// Flat store of credits with a per-account index.
#[derive(Clone, Debug, Default)]
pub struct CreditStore {
    by_outpoint: HashMap<Outpoint, Credit>,
    by_account: HashMap<AccountId, BTreeSet<Outpoint>>,
}

impl CreditStore {
    pub fn new() -> Self {
        CreditStore::default()
    }

    /// Insert a credit, replacing any previous record at the same outpoint.
    pub fn insert(&mut self, credit: Credit) {
        self.by_account
            .entry(credit.path.account)
            .or_default()
            .insert(credit.outpoint);
        self.by_outpoint.insert(credit.outpoint, credit);
    }

    pub fn get(&self, outpoint: &Outpoint) -> Option<&Credit> {
        self.by_outpoint.get(outpoint)
    }

    pub fn contains(&self, outpoint: &Outpoint) -> bool {
        self.by_outpoint.contains_key(outpoint)
    }

    /// Mark a credit spent by `by`. Returns false if the credit is missing
    /// or already spent.
    pub fn mark_spent(&mut self, outpoint: &Outpoint, by: TxId) -> bool {
        match self.by_outpoint.get_mut(outpoint) {
            Some(credit) if credit.spent_by.is_none() => {
                credit.spent_by = Some(by);
                true
            }
            _ => false,
        }
    }

    /// Clear a credit's spender. Returns false if the credit is missing or
    /// not spent.
    pub fn mark_unspent(&mut self, outpoint: &Outpoint) -> bool {
        match self.by_outpoint.get_mut(outpoint) {
            Some(credit) if credit.spent_by.is_some() => {
                credit.spent_by = None;
                true
            }
            _ => false,
        }
    }

    /// Set or clear the confirmation height of a credit.
    pub fn set_height(&mut self, outpoint: &Outpoint, height: Option<u32>) -> bool {
        match self.by_outpoint.get_mut(outpoint) {
            Some(credit) => {
                credit.height = height;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, outpoint: &Outpoint) -> Option<Credit> {
        let credit = self.by_outpoint.remove(outpoint)?;
        if let Some(set) = self.by_account.get_mut(&credit.path.account) {
            set.remove(outpoint);
            if set.is_empty() {
                self.by_account.remove(&credit.path.account);
            }
        }
        Some(credit)
    }

    /// Iterate every credit in the wallet.
    pub fn iter(&self) -> impl Iterator<Item = &Credit> {
        self.by_outpoint.values()
    }

    /// Iterate the credits of one account in outpoint order.
    pub fn iter_account(&self, id: AccountId) -> impl Iterator<Item = &Credit> + '_ {
        self.by_account
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(move |outpoint| self.by_outpoint.get(outpoint))
    }

    pub fn len(&self) -> usize {
        self.by_outpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_outpoint.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Branch;

    fn credit(tx_byte: u8, vout: u32, account: u32, value: u64) -> Credit {
        Credit {
            outpoint: Outpoint::new(TxId([tx_byte; 32]), vout),
            value,
            path: KeyPath {
                account: AccountId(account),
                branch: Branch::Receive,
                index: 0,
            },
            class: CovenantClass::None,
            spent_by: None,
            height: None,
            coinbase: false,
        }
    }

    #[test]
    fn spend_cycle() {
        let mut store = CreditStore::new();
        let c = credit(1, 0, 0, 100);
        let outpoint = c.outpoint;
        store.insert(c);

        let spender = TxId([2u8; 32]);
        assert!(store.mark_spent(&outpoint, spender));
        assert_eq!(store.get(&outpoint).unwrap().spent_by, Some(spender));
        // Double spend of the same credit is refused.
        assert!(!store.mark_spent(&outpoint, TxId([3u8; 32])));
        assert!(store.mark_unspent(&outpoint));
        assert!(!store.mark_unspent(&outpoint));
    }

    #[test]
    fn account_index_follows_removal() {
        let mut store = CreditStore::new();
        store.insert(credit(1, 0, 0, 100));
        store.insert(credit(1, 1, 1, 200));
        store.insert(credit(2, 0, 1, 300));

        assert_eq!(store.iter_account(AccountId(1)).count(), 2);
        let removed = store
            .remove(&Outpoint::new(TxId([1u8; 32]), 1))
            .expect("credit present");
        assert_eq!(removed.value, 200);
        assert_eq!(store.iter_account(AccountId(1)).count(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn set_height_roundtrip() {
        let mut store = CreditStore::new();
        let c = credit(1, 0, 0, 100);
        let outpoint = c.outpoint;
        store.insert(c);
        assert!(store.set_height(&outpoint, Some(42)));
        assert!(store.get(&outpoint).unwrap().is_confirmed());
        assert!(store.set_height(&outpoint, None));
        assert!(!store.get(&outpoint).unwrap().is_confirmed());
    }
}
