//! Gap-limit discovery: depth advancement and retroactive claims.
//!
//! Discovery is not an event of its own. It is the resolve phase that runs
//! before any event whose ownership resolution could change the six-tuple:
//! observing an owned output at or past the current depth advances the
//! branch depth, the advanced depth widens the recognition window, and the
//! widened window may expose outputs the wallet recorded as foreign when
//! their transaction was journaled. Those become retroactive claims, which
//! the dispatcher turns into retro deltas against the entry's owned-view
//! snapshot.
//!
//! Depth advancement runs to fixpoint: claiming index `i` extends the
//! window to `i + 1 + lookahead`, which can expose a further output of the
//! same transaction.

use crate::account::{AccountError, AddressBook, KeyPath};
use crate::balance::OwnedView;
use crate::chain::{Outpoint, TxId, TxOutput};
use crate::covenant::{classify, CovenantClass};
use crate::credit::CreditStore;
use crate::journal::{Journal, TxState};

/// Outcome of a depth-advancement pass.
#[derive(Debug, Default)]
pub struct AdvanceOutcome {
    /// Whether any branch depth moved.
    pub advanced: bool,
    /// The first ceiling hit, if any. Advancement continues on the other
    /// branches; the dispatcher surfaces this to the host.
    pub exhausted: Option<AccountError>,
}

/// Advance branch depths over the owned outputs of one transaction, to
/// fixpoint. Upholds the depth invariant: once a credit exists at
/// `(branch, index)`, the branch depth exceeds `index`.
pub fn observe_outputs(book: &mut AddressBook, outputs: &[TxOutput]) -> AdvanceOutcome {
    let mut outcome = AdvanceOutcome::default();
    loop {
        let mut moved = false;
        for output in outputs {
            let Some(path) = book.owner_of(&output.address) else {
                continue;
            };
            if path.index < book.account(path.account).depth(path.branch) {
                continue;
            }
            match book.advance_depth(path.account, path.branch, path.index) {
                Ok(advanced) => moved |= advanced,
                Err(err) => {
                    if outcome.exhausted.is_none() {
                        outcome.exhausted = Some(err);
                    }
                }
            }
        }
        if !moved {
            break;
        }
        outcome.advanced = true;
    }
    outcome
}

/// A previously-foreign output that the current window now recognizes.
#[derive(Clone, Debug)]
pub struct RetroClaim {
    pub txid: TxId,
    pub vout: u32,
    pub path: KeyPath,
    pub value: u64,
    pub class: CovenantClass,
    /// State of the containing transaction; selects whether the confirmed
    /// half of the claim delta applies.
    pub state: TxState,
}

/// One scan of the journal for outputs newly inside the window.
///
/// Returns an empty vector at fixpoint. The dispatcher applies the claims
/// (credits, retro deltas, owned-view updates, further depth advancement)
/// and scans again, because a claim at index `i` can widen the window past
/// another forgotten output.
pub fn scan_journal(
    book: &AddressBook,
    journal: &Journal,
    credits: &CreditStore,
) -> Vec<RetroClaim> {
    let mut claims = Vec::new();
    for entry in journal.iter() {
        for (vout, output) in entry.tx.outputs.iter().enumerate() {
            let vout = vout as u32;
            if entry.owned.outputs.iter().any(|o| o.vout == vout) {
                continue;
            }
            let outpoint = Outpoint::new(entry.txid, vout);
            if credits.contains(&outpoint) {
                continue;
            }
            let Some(path) = book.owner_of(&output.address) else {
                continue;
            };
            claims.push(RetroClaim {
                txid: entry.txid,
                vout,
                path,
                value: output.value,
                class: classify(&output.covenant),
                state: entry.state,
            });
        }
    }
    claims
}

/// Resolve the ownership view of a transaction at the current address-book
/// state. Inputs resolve through recorded credits only; the dispatcher
/// layers inline-coin materialization on top of this.
pub fn resolve_view(book: &AddressBook, credits: &CreditStore, tx: &crate::chain::TxRecord) -> OwnedView {
    let txid = tx.txid();
    let mut view = OwnedView::default();
    for input in &tx.inputs {
        if let Some(credit) = credits.get(&input.prevout) {
            // Skip credits already claimed by a different spender; the
            // dispatcher rejects the conflict before applying anything.
            if credit.spent_by.is_none() || credit.spent_by == Some(txid) {
                view.inputs.push(crate::balance::OwnedInput {
                    prevout: credit.outpoint,
                    account: credit.path.account,
                    value: credit.value,
                    class: credit.class,
                });
            }
        }
    }
    for (vout, output) in tx.outputs.iter().enumerate() {
        if let Some(path) = book.owner_of(&output.address) {
            view.outputs.push(crate::balance::OwnedOutput {
                vout: vout as u32,
                path,
                value: output.value,
                class: classify(&output.covenant),
            });
        }
    }
    view
}
