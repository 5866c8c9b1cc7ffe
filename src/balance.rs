//! The balance six-tuple and the per-event delta algebra.
//!
//! This is the heart of the engine. Every ingestion event reduces to a
//! signed six-tuple delta per touched scope, computed as a pure function of
//! the owned-input/owned-output view of the transaction at event time. The
//! four event kinds come in strict inverse pairs: erase inverts insert,
//! unconfirm inverts confirm. Everything else in the crate exists to feed
//! these functions the right views in the right order.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::account::{AccountId, KeyPath};
use crate::chain::Outpoint;
use crate::covenant::CovenantClass;

/// Errors surfaced when a delta cannot be applied without breaking a
/// balance invariant. Always fatal for the wallet.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("balance column {column} left range (delta {delta} against {current})")]
    Range {
        column: &'static str,
        current: u64,
        delta: i128,
    },
    #[error("locked balance exceeds total: {locked} > {total} ({which})")]
    Containment {
        which: &'static str,
        locked: u64,
        total: u64,
    },
}

/// The balance vector of one scope (an account, or the whole wallet).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Number of journal transactions touching the scope.
    pub tx: u64,
    /// Number of unspent credits in the scope.
    pub coin: u64,
    /// Value of unspent confirmed credits, locked included.
    pub confirmed: u64,
    /// Value of unspent credits regardless of height, locked included.
    pub unconfirmed: u64,
    /// Confirmed value held by auction covenants.
    pub locked_confirmed: u64,
    /// Total value held by auction covenants.
    pub locked_unconfirmed: u64,
}

impl Balance {
    /// Apply a signed delta, failing on any column underflow or overflow.
    /// On failure `self` is untouched.
    pub fn apply(&self, delta: &BalanceDelta) -> Result<Balance, BalanceError> {
        Ok(Balance {
            tx: apply_count("tx", self.tx, delta.tx)?,
            coin: apply_count("coin", self.coin, delta.coin)?,
            confirmed: apply_value("confirmed", self.confirmed, delta.confirmed)?,
            unconfirmed: apply_value("unconfirmed", self.unconfirmed, delta.unconfirmed)?,
            locked_confirmed: apply_value(
                "locked_confirmed",
                self.locked_confirmed,
                delta.locked_confirmed,
            )?,
            locked_unconfirmed: apply_value(
                "locked_unconfirmed",
                self.locked_unconfirmed,
                delta.locked_unconfirmed,
            )?,
        })
    }

    /// Containment invariant: the locked columns never exceed their totals.
    pub fn check_containment(&self) -> Result<(), BalanceError> {
        if self.locked_confirmed > self.confirmed {
            return Err(BalanceError::Containment {
                which: "confirmed",
                locked: self.locked_confirmed,
                total: self.confirmed,
            });
        }
        if self.locked_unconfirmed > self.unconfirmed {
            return Err(BalanceError::Containment {
                which: "unconfirmed",
                locked: self.locked_unconfirmed,
                total: self.unconfirmed,
            });
        }
        Ok(())
    }
}

fn apply_count(column: &'static str, current: u64, delta: i64) -> Result<u64, BalanceError> {
    current
        .checked_add_signed(delta)
        .ok_or(BalanceError::Range {
            column,
            current,
            delta: delta as i128,
        })
}

fn apply_value(column: &'static str, current: u64, delta: i128) -> Result<u64, BalanceError> {
    let next = current as i128 + delta;
    u64::try_from(next).map_err(|_| BalanceError::Range {
        column,
        current,
        delta,
    })
}

/// A signed six-tuple delta.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BalanceDelta {
    pub tx: i64,
    pub coin: i64,
    pub confirmed: i128,
    pub unconfirmed: i128,
    pub locked_confirmed: i128,
    pub locked_unconfirmed: i128,
}

impl BalanceDelta {
    pub fn is_zero(&self) -> bool {
        *self == BalanceDelta::default()
    }

    /// The exact inverse delta.
    pub fn inverse(&self) -> BalanceDelta {
        BalanceDelta {
            tx: -self.tx,
            coin: -self.coin,
            confirmed: -self.confirmed,
            unconfirmed: -self.unconfirmed,
            locked_confirmed: -self.locked_confirmed,
            locked_unconfirmed: -self.locked_unconfirmed,
        }
    }
}

/// An owned input as resolved at event time: the credit being spent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedInput {
    pub prevout: Outpoint,
    pub account: AccountId,
    pub value: u64,
    pub class: CovenantClass,
}

/// An owned output as resolved at event time, with the key path that claimed
/// it — the credit store records the full derivation coordinates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedOutput {
    pub vout: u32,
    pub path: KeyPath,
    pub value: u64,
    pub class: CovenantClass,
}

impl OwnedOutput {
    pub fn account(&self) -> AccountId {
        self.path.account
    }
}

/// The ownership view of a transaction: which of its inputs and outputs the
/// wallet owns, resolved at the current address-book state. Journal entries
/// snapshot this; discovery updates the snapshot as ownership grows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedView {
    pub inputs: Vec<OwnedInput>,
    pub outputs: Vec<OwnedOutput>,
}

impl OwnedView {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    /// The set of accounts this view touches.
    pub fn accounts(&self) -> BTreeSet<AccountId> {
        self.inputs
            .iter()
            .map(|i| i.account)
            .chain(self.outputs.iter().map(|o| o.account()))
            .collect()
    }

    pub fn touches(&self, id: AccountId) -> bool {
        self.inputs.iter().any(|i| i.account == id)
            || self.outputs.iter().any(|o| o.account() == id)
    }
}

/// Scope selector for delta computation: one account, or the whole wallet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Wallet,
    Account(AccountId),
}

impl Scope {
    fn admits_input(self, input: &OwnedInput) -> bool {
        match self {
            Scope::Wallet => true,
            Scope::Account(id) => input.account == id,
        }
    }

    fn admits_output(self, output: &OwnedOutput) -> bool {
        match self {
            Scope::Wallet => true,
            Scope::Account(id) => output.account() == id,
        }
    }
}

struct ViewSums {
    inputs: i64,
    outputs: i64,
    in_value: i128,
    out_value: i128,
    in_locked: i128,
    out_locked: i128,
}

fn sum_view(view: &OwnedView, scope: Scope) -> ViewSums {
    let mut sums = ViewSums {
        inputs: 0,
        outputs: 0,
        in_value: 0,
        out_value: 0,
        in_locked: 0,
        out_locked: 0,
    };
    for input in view.inputs.iter().filter(|i| scope.admits_input(i)) {
        sums.inputs += 1;
        sums.in_value += input.value as i128;
        if input.class.is_locked() {
            sums.in_locked += input.value as i128;
        }
    }
    for output in view.outputs.iter().filter(|o| scope.admits_output(o)) {
        sums.outputs += 1;
        sums.out_value += output.value as i128;
        if output.class.is_locked() {
            sums.out_locked += output.value as i128;
        }
    }
    sums
}

/// Delta for a transaction entering the pending view for the first time.
///
/// `count_tx` is false for retroactive (discovery) applications of the same
/// rule, where the scope already counted the transaction.
pub fn insert_delta(view: &OwnedView, scope: Scope, count_tx: bool) -> BalanceDelta {
    let sums = sum_view(view, scope);
    BalanceDelta {
        tx: count_tx as i64,
        coin: sums.outputs - sums.inputs,
        confirmed: 0,
        unconfirmed: sums.out_value - sums.in_value,
        locked_confirmed: 0,
        locked_unconfirmed: sums.out_locked - sums.in_locked,
    }
}

/// Delta for confirmation: the confirmed pair moves by the same amounts the
/// unconfirmed pair moved at insert, over the current owned view.
pub fn confirm_delta(view: &OwnedView, scope: Scope) -> BalanceDelta {
    let sums = sum_view(view, scope);
    BalanceDelta {
        tx: 0,
        coin: 0,
        confirmed: sums.out_value - sums.in_value,
        unconfirmed: 0,
        locked_confirmed: sums.out_locked - sums.in_locked,
        locked_unconfirmed: 0,
    }
}

/// Delta for unconfirmation: exact inverse of the most recent confirm.
pub fn unconfirm_delta(view: &OwnedView, scope: Scope) -> BalanceDelta {
    confirm_delta(view, scope).inverse()
}

/// Delta for erasing a pending transaction: exact inverse of insert.
pub fn erase_delta(view: &OwnedView, scope: Scope, count_tx: bool) -> BalanceDelta {
    insert_delta(view, scope, count_tx).inverse()
}

/// Standalone delta for retroactively claiming a single credit that was
/// foreign when its transaction was journaled. `confirmed` selects whether
/// the confirmed half applies too (the containing tx is confirmed, or the
/// claim comes from an inline coin with a height).
pub fn claim_delta(value: u64, class: CovenantClass, confirmed: bool) -> BalanceDelta {
    let locked = if class.is_locked() { value as i128 } else { 0 };
    BalanceDelta {
        tx: 0,
        coin: 1,
        confirmed: if confirmed { value as i128 } else { 0 },
        unconfirmed: value as i128,
        locked_confirmed: if confirmed { locked } else { 0 },
        locked_unconfirmed: locked,
    }
}
