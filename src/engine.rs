//! The event dispatcher: the single entry point for chain and mempool events.
//!
//! Each event acquires the wallet's exclusive write lock, runs the resolve
//! phase (discovery: depth advancement and retroactive claims), computes the
//! per-scope deltas, mutates the credit store and journal, applies the
//! deltas with invariant checks, persists the touched records, and returns
//! the wallet's final tuple. Balance reads take the shared lock and never
//! fail.
//!
//! Discovery performed during the resolve phase commits even when the apply
//! phase aborts: an advanced depth or a retroactive claim is an
//! independently consistent gain of knowledge, not part of the aborted
//! event.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::account::{AccountError, AccountId, AddressBook, Branch, WalletSeed};
use crate::balance::{
    claim_delta, confirm_delta, erase_delta, insert_delta, unconfirm_delta, Balance,
    BalanceDelta, BalanceError, OwnedOutput, Scope,
};
use crate::chain::{ChainView, Outpoint, ScriptHash, TxId, TxRecord};
use crate::config::EngineConfig;
use crate::covenant::classify;
use crate::credit::{Credit, CreditStore};
use crate::discovery::{self, RetroClaim};
use crate::journal::{Journal, JournalError, TxState};
use crate::store::{BalanceKey, StoreError, WalletStore};

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The event is not legal from the transaction's current journal state.
    /// Reported, never recovered; state is left unchanged.
    #[error("illegal transition for {txid}: {reason}")]
    IllegalTransition { txid: TxId, reason: String },
    /// A balance invariant broke. Fatal: the wallet is quarantined until
    /// `recalculate_balances` rebuilds the tuples from ground truth.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// The wallet is quarantined; only `recalculate_balances` is accepted.
    #[error("wallet is quarantined pending recompute")]
    Quarantined,
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    fn illegal(txid: TxId, reason: impl Into<String>) -> Self {
        EngineError::IllegalTransition {
            txid,
            reason: reason.into(),
        }
    }
}

impl From<JournalError> for EngineError {
    fn from(err: JournalError) -> Self {
        let txid = match err {
            JournalError::NotFound(txid)
            | JournalError::Exists(txid)
            | JournalError::NotPending(txid)
            | JournalError::NotConfirmed(txid) => txid,
            JournalError::AlreadyConfirmed { txid, .. } => txid,
        };
        EngineError::illegal(txid, err.to_string())
    }
}

impl From<BalanceError> for EngineError {
    fn from(err: BalanceError) -> Self {
        EngineError::InvariantViolation(err.to_string())
    }
}

/// In-memory wallet state guarded by the per-wallet lock.
struct WalletState {
    book: AddressBook,
    credits: CreditStore,
    journal: Journal,
    balances: HashMap<BalanceKey, Balance>,
    quarantined: bool,
    discovery_stalled: bool,
}

/// Records touched by the current event, flushed together at the end.
#[derive(Default)]
struct Dirty {
    accounts: BTreeSet<AccountId>,
    credits: BTreeSet<Outpoint>,
    removed_credits: BTreeSet<Outpoint>,
    journal: BTreeSet<TxId>,
    removed_journal: BTreeSet<TxId>,
    balances: BTreeSet<BalanceKey>,
}

impl Dirty {
    fn credit(&mut self, outpoint: Outpoint) {
        self.removed_credits.remove(&outpoint);
        self.credits.insert(outpoint);
    }

    fn remove_credit(&mut self, outpoint: Outpoint) {
        self.credits.remove(&outpoint);
        self.removed_credits.insert(outpoint);
    }

    fn entry(&mut self, txid: TxId) {
        self.removed_journal.remove(&txid);
        self.journal.insert(txid);
    }

    fn remove_entry(&mut self, txid: TxId) {
        self.journal.remove(&txid);
        self.removed_journal.insert(txid);
    }
}

/// The wallet accounting engine. One instance per wallet.
pub struct WalletEngine {
    wallet_id: u64,
    config: EngineConfig,
    seed: WalletSeed,
    store: Box<dyn WalletStore>,
    state: RwLock<WalletState>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl WalletEngine {
    /// Create a fresh wallet with a default account and persist it.
    pub fn create(
        wallet_id: u64,
        seed: WalletSeed,
        config: EngineConfig,
        store: Box<dyn WalletStore>,
    ) -> Result<Self, EngineError> {
        let mut book = AddressBook::new(config.lookahead_ceiling);
        let account_seed = seed.account_seed(crate::constants::DEFAULT_ACCOUNT);
        let id = book.create_account(crate::constants::DEFAULT_ACCOUNT, account_seed, config.lookahead)?;

        let mut balances = HashMap::new();
        balances.insert(BalanceKey::Wallet, Balance::default());
        balances.insert(BalanceKey::Account(id), Balance::default());

        store.put_account(book.account(id))?;
        store.put_balance(BalanceKey::Wallet, &Balance::default())?;
        store.put_balance(BalanceKey::Account(id), &Balance::default())?;
        store.flush()?;

        tracing::info!(wallet = wallet_id, "created wallet");
        Ok(WalletEngine {
            wallet_id,
            config,
            seed,
            store,
            state: RwLock::new(WalletState {
                book,
                credits: CreditStore::new(),
                journal: Journal::new(),
                balances,
                quarantined: false,
                discovery_stalled: false,
            }),
        })
    }

    /// Reopen a wallet from a previously flushed store. Creates the default
    /// account if the store is empty.
    pub fn open(
        wallet_id: u64,
        seed: WalletSeed,
        config: EngineConfig,
        store: Box<dyn WalletStore>,
    ) -> Result<Self, EngineError> {
        let accounts = store.load_accounts()?;
        if accounts.is_empty() {
            return Self::create(wallet_id, seed, config, store);
        }

        let mut book = AddressBook::new(config.lookahead_ceiling);
        let mut balances = HashMap::new();
        balances.insert(BalanceKey::Wallet, Balance::default());
        for account in accounts {
            let id = book.restore_account(account)?;
            balances.insert(BalanceKey::Account(id), Balance::default());
        }

        let mut credits = CreditStore::new();
        for credit in store.load_credits()? {
            credits.insert(credit);
        }
        let mut journal = Journal::new();
        for entry in store.load_journal()? {
            journal.restore(entry);
        }
        for (key, balance) in store.load_balances()? {
            balances.insert(key, balance);
        }

        tracing::info!(
            wallet = wallet_id,
            credits = credits.len(),
            journal = journal.len(),
            "opened wallet"
        );
        Ok(WalletEngine {
            wallet_id,
            config,
            seed,
            store,
            state: RwLock::new(WalletState {
                book,
                credits,
                journal,
                balances,
                quarantined: false,
                discovery_stalled: false,
            }),
        })
    }

    // ── Balance reads ───────────────────────────────────────────────────

    /// The wallet-scope tuple. Never fails; returns the last consistent
    /// value even while a background check is pending.
    pub fn balance(&self) -> Balance {
        let state = self.read_state();
        state
            .balances
            .get(&BalanceKey::Wallet)
            .copied()
            .unwrap_or_default()
    }

    /// The tuple of one account.
    pub fn account_balance(&self, name: &str) -> Result<Balance, EngineError> {
        let state = self.read_state();
        let account = state
            .book
            .account_by_name(name)
            .ok_or_else(|| EngineError::Account(AccountError::Unknown(name.to_string())))?;
        Ok(state
            .balances
            .get(&BalanceKey::Account(account.id))
            .copied()
            .unwrap_or_default())
    }

    /// Every account tuple by name, for JSON snapshot observers.
    pub fn account_balances(&self) -> Vec<(String, Balance)> {
        let state = self.read_state();
        state
            .book
            .accounts()
            .iter()
            .map(|account| {
                let balance = state
                    .balances
                    .get(&BalanceKey::Account(account.id))
                    .copied()
                    .unwrap_or_default();
                (account.name.clone(), balance)
            })
            .collect()
    }

    /// Whether discovery hit the depth ceiling and is stalled until the
    /// ceiling is raised.
    pub fn discovery_stalled(&self) -> bool {
        self.read_state().discovery_stalled
    }

    /// Derive a receive address at an arbitrary index without registering
    /// it or advancing the depth. Addresses inside the window are
    /// recognized on arrival either way; this exists so hosts can display
    /// future addresses and tests can build gap-missed outputs.
    pub fn derive_receive(&self, account: &str, index: u32) -> Result<ScriptHash, EngineError> {
        let state = self.read_state();
        let account = state
            .book
            .account_by_name(account)
            .ok_or_else(|| EngineError::Account(AccountError::Unknown(account.to_string())))?;
        Ok(account.derive(Branch::Receive, index))
    }

    /// Current receive depth of an account.
    pub fn receive_depth(&self, account: &str) -> Result<u32, EngineError> {
        let state = self.read_state();
        let account = state
            .book
            .account_by_name(account)
            .ok_or_else(|| EngineError::Account(AccountError::Unknown(account.to_string())))?;
        Ok(account.receive_depth)
    }

    // ── Mempool and chain events ────────────────────────────────────────

    /// A transaction entered the mempool-level view.
    ///
    /// Irrelevant transactions (no owned inputs or outputs after discovery)
    /// are ignored; re-inserting an already-pending transaction is a no-op.
    pub fn insert_pending(&self, tx: &TxRecord) -> Result<Balance, EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        let txid = tx.txid();
        if let Some(entry) = state.journal.get(&txid) {
            if entry.is_pending() {
                tracing::debug!(tx = %txid, "duplicate pending insert ignored");
                return Ok(self.wallet_balance(&state));
            }
            return Err(EngineError::illegal(txid, "transaction is already confirmed"));
        }

        let mut dirty = Dirty::default();
        self.resolve(&mut state, Some(tx), &mut dirty)?;
        self.apply_insert(&mut state, tx, &mut dirty)?;
        self.finish_event(&mut state, dirty, "insert_pending", txid)
    }

    /// A transaction was included in the active chain at `height`.
    ///
    /// Handles both the pending → confirmed transition and the atomic
    /// block-insert of a never-seen transaction. Confirming an already
    /// confirmed transaction at the same height is a no-op; at a different
    /// height it is illegal (unconfirm first).
    pub fn confirm(&self, tx: &TxRecord, height: u32) -> Result<Balance, EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        let txid = tx.txid();

        if let Some(entry) = state.journal.get(&txid) {
            if let Some(existing) = entry.height() {
                if existing == height {
                    tracing::debug!(tx = %txid, height, "re-confirm at same height ignored");
                    return Ok(self.wallet_balance(&state));
                }
                return Err(EngineError::illegal(
                    txid,
                    format!("already confirmed at height {existing}; unconfirm first"),
                ));
            }
        }

        let mut dirty = Dirty::default();
        self.resolve(&mut state, Some(tx), &mut dirty)?;

        if !state.journal.contains(&txid) {
            self.evict_conflicts(&mut state, tx, txid, &mut dirty)?;
            let relevant = self.apply_insert(&mut state, tx, &mut dirty)?;
            if !relevant {
                return Err(EngineError::illegal(
                    txid,
                    "confirm of unknown transaction with no owned outputs",
                ));
            }
        }
        self.apply_confirm(&mut state, txid, height, &mut dirty)?;
        self.finish_event(&mut state, dirty, "confirm", txid)
    }

    /// A confirmed transaction left the active chain (reorg).
    pub fn unconfirm(&self, txid: &TxId) -> Result<Balance, EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        match state.journal.get(txid) {
            None => return Err(EngineError::illegal(*txid, "unknown transaction")),
            Some(entry) if entry.is_pending() => {
                return Err(EngineError::illegal(*txid, "transaction is not confirmed"))
            }
            Some(_) => {}
        }

        let mut dirty = Dirty::default();
        self.resolve(&mut state, None, &mut dirty)?;
        self.apply_unconfirm(&mut state, *txid, &mut dirty)?;
        self.finish_event(&mut state, dirty, "unconfirm", *txid)
    }

    /// A pending transaction was evicted. Only legal while pending; a
    /// confirmed transaction must be unconfirmed first.
    pub fn erase(&self, txid: &TxId) -> Result<Balance, EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        let mut dirty = Dirty::default();
        self.resolve(&mut state, None, &mut dirty)?;
        self.apply_erase(&mut state, *txid, &mut dirty)?;
        self.finish_event(&mut state, dirty, "erase", *txid)
    }

    /// Mass-unconfirm every transaction above `height`, newest first,
    /// leaving them pending. The reorg primitive.
    pub fn revert_to(&self, height: u32) -> Result<Balance, EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        let mut dirty = Dirty::default();
        let victims = state.journal.confirmed_above(height);
        for txid in &victims {
            self.apply_unconfirm(&mut state, *txid, &mut dirty)?;
        }
        tracing::info!(
            wallet = self.wallet_id,
            height,
            unconfirmed = victims.len(),
            "reverted chain state"
        );
        self.finish(&mut state, dirty)
    }

    /// Replay chain state from `from` against a chain view. Matched
    /// transactions become confirmed-inserts; transactions already
    /// confirmed at their replayed height are no-ops; journal transactions
    /// confirmed at or above `from` that the replay never produced are
    /// unconfirmed.
    pub fn rescan(&self, chain: &dyn ChainView, from: u32) -> Result<Balance, EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        let mut dirty = Dirty::default();
        let mut seen: BTreeSet<TxId> = BTreeSet::new();

        let tip = chain.tip();
        for height in from..=tip {
            let Some(block) = chain.block(height) else {
                break;
            };
            for tx in &block.txs {
                let txid = tx.txid();
                self.resolve(&mut state, Some(tx), &mut dirty)?;

                match state.journal.get(&txid).map(|e| e.height()) {
                    Some(Some(existing)) if existing == height => {
                        seen.insert(txid);
                    }
                    Some(Some(_)) => {
                        self.apply_unconfirm(&mut state, txid, &mut dirty)?;
                        self.apply_confirm(&mut state, txid, height, &mut dirty)?;
                        seen.insert(txid);
                    }
                    Some(None) => {
                        self.apply_confirm(&mut state, txid, height, &mut dirty)?;
                        seen.insert(txid);
                    }
                    None => {
                        self.evict_conflicts(&mut state, tx, txid, &mut dirty)?;
                        if self.apply_insert(&mut state, tx, &mut dirty)? {
                            self.apply_confirm(&mut state, txid, height, &mut dirty)?;
                            seen.insert(txid);
                        }
                    }
                }
            }
        }

        // Anything the replay did not produce is no longer on the chain.
        for txid in state.journal.confirmed_from(from) {
            if !seen.contains(&txid) {
                self.apply_unconfirm(&mut state, txid, &mut dirty)?;
            }
        }

        tracing::info!(wallet = self.wallet_id, from, tip, "rescan complete");
        self.finish(&mut state, dirty)
    }

    /// Erase pending transactions older than `age_secs`, optionally
    /// restricted to one account. Children are erased before parents
    /// (reverse arrival order). Returns the number erased.
    pub fn zap(&self, account: Option<&str>, age_secs: u64) -> Result<usize, EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        let scope = match account {
            Some(name) => Some(
                state
                    .book
                    .account_by_name(name)
                    .ok_or_else(|| EngineError::Account(AccountError::Unknown(name.to_string())))?
                    .id,
            ),
            None => None,
        };
        let cutoff = now_secs().saturating_sub(age_secs);
        let mut victims: Vec<TxId> = state
            .journal
            .pending()
            .iter()
            .filter(|e| e.added_at <= cutoff)
            .filter(|e| scope.map(|id| e.owned.touches(id)).unwrap_or(true))
            .map(|e| e.txid)
            .collect();
        victims.reverse();

        let mut dirty = Dirty::default();
        for txid in &victims {
            self.apply_erase(&mut state, *txid, &mut dirty)?;
        }
        tracing::info!(
            wallet = self.wallet_id,
            zapped = victims.len(),
            "zapped stale pending transactions"
        );
        self.finish(&mut state, dirty)?;
        Ok(victims.len())
    }

    /// Rebuild every scope's tuple from the credit store and journal,
    /// replacing the cached values and clearing quarantine.
    pub fn recalculate_balances(&self) -> Result<Balance, EngineError> {
        let mut state = self.write_state();
        let recomputed = recompute(&state);
        let mut dirty = Dirty::default();
        for key in recomputed.keys() {
            dirty.balances.insert(*key);
        }
        for key in state.balances.keys() {
            dirty.balances.insert(*key);
        }
        state.balances = recomputed;
        state.quarantined = false;
        tracing::info!(wallet = self.wallet_id, "balances recalculated from credits");
        self.finish(&mut state, dirty)
    }

    // ── Address-book mutations ──────────────────────────────────────────

    /// Create a named account derived from the wallet seed.
    pub fn create_account(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        let seed = self.seed.account_seed(name);
        let id = state.book.create_account(name, seed, self.config.lookahead)?;
        state.balances.entry(BalanceKey::Account(id)).or_default();

        let mut dirty = Dirty::default();
        dirty.accounts.insert(id);
        dirty.balances.insert(BalanceKey::Account(id));
        // The fresh window may already cover journaled outputs.
        self.run_discovery(&mut state, &mut dirty)?;
        self.finish(&mut state, dirty)?;
        tracing::info!(wallet = self.wallet_id, account = name, "created account");
        Ok(())
    }

    /// Derive the next receive address of an account, advancing its depth.
    pub fn create_receive(&self, account: &str) -> Result<ScriptHash, EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        let (id, index) = {
            let account = state
                .book
                .account_by_name(account)
                .ok_or_else(|| EngineError::Account(AccountError::Unknown(account.to_string())))?;
            (account.id, account.receive_depth)
        };
        let address = state.book.account(id).derive(Branch::Receive, index);
        state.book.advance_depth(id, Branch::Receive, index)?;

        let mut dirty = Dirty::default();
        dirty.accounts.insert(id);
        self.run_discovery(&mut state, &mut dirty)?;
        self.finish(&mut state, dirty)?;
        Ok(address)
    }

    /// Pre-derive `ahead` receive indices past the current depth and claim
    /// anything the widened window exposes. The gap-limit recovery path.
    pub fn discover(&self, account: &str, ahead: u32) -> Result<Balance, EngineError> {
        let mut state = self.write_state();
        self.check_open(&state)?;
        let id = {
            let account = state
                .book
                .account_by_name(account)
                .ok_or_else(|| EngineError::Account(AccountError::Unknown(account.to_string())))?;
            account.id
        };
        let mut dirty = Dirty::default();
        if ahead > 0 {
            let depth = state.book.account(id).receive_depth;
            let target = depth.saturating_add(ahead) - 1;
            state.book.advance_depth(id, Branch::Receive, target)?;
            dirty.accounts.insert(id);
        }
        self.run_discovery(&mut state, &mut dirty)?;
        self.finish(&mut state, dirty)
    }

    // ── Resolve phase ───────────────────────────────────────────────────

    /// Discovery entry point run before every event: observe the event
    /// transaction's outputs (advancing depths to fixpoint), then claim
    /// whatever the widened window exposes across the journal.
    fn resolve(
        &self,
        state: &mut WalletState,
        tx: Option<&TxRecord>,
        dirty: &mut Dirty,
    ) -> Result<(), EngineError> {
        if let Some(tx) = tx {
            let outcome = discovery::observe_outputs(&mut state.book, &tx.outputs);
            if outcome.advanced {
                for account in state.book.accounts() {
                    dirty.accounts.insert(account.id);
                }
            }
            if let Some(err) = outcome.exhausted {
                state.discovery_stalled = true;
                tracing::warn!(wallet = self.wallet_id, error = %err, "discovery stalled at depth ceiling");
            }
        }
        self.run_discovery(state, dirty)
    }

    /// Claim journal outputs newly inside the window, to fixpoint.
    fn run_discovery(&self, state: &mut WalletState, dirty: &mut Dirty) -> Result<(), EngineError> {
        loop {
            let claims = discovery::scan_journal(&state.book, &state.journal, &state.credits);
            if claims.is_empty() {
                return Ok(());
            }
            for claim in claims {
                self.apply_claim(state, claim, dirty)?;
            }
        }
    }

    /// Apply one retroactive claim: advance the depth past the claimed
    /// index, record the credit, fold the output into the entry's owned
    /// view, and apply the retro deltas (both halves when the transaction
    /// is confirmed; `tx` only when the account was untouched before).
    fn apply_claim(
        &self,
        state: &mut WalletState,
        claim: RetroClaim,
        dirty: &mut Dirty,
    ) -> Result<(), EngineError> {
        match state
            .book
            .advance_depth(claim.path.account, claim.path.branch, claim.path.index)
        {
            Ok(true) => {
                dirty.accounts.insert(claim.path.account);
            }
            Ok(false) => {}
            Err(err @ AccountError::LookaheadExhausted { .. }) => {
                state.discovery_stalled = true;
                tracing::warn!(wallet = self.wallet_id, error = %err, "discovery stalled at depth ceiling");
            }
            Err(err) => return Err(err.into()),
        }

        let outpoint = Outpoint::new(claim.txid, claim.vout);
        let confirmed = matches!(claim.state, TxState::Confirmed { .. });
        let (first_touch, coinbase) = {
            let Some(entry) = state.journal.get_mut(&claim.txid) else {
                return Ok(());
            };
            let first_touch = !entry.owned.touches(claim.path.account);
            entry.owned.outputs.push(OwnedOutput {
                vout: claim.vout,
                path: claim.path,
                value: claim.value,
                class: claim.class,
            });
            entry.owned.outputs.sort_by_key(|o| o.vout);
            (first_touch, entry.tx.is_coinbase())
        };
        dirty.entry(claim.txid);

        state.credits.insert(Credit {
            outpoint,
            value: claim.value,
            path: claim.path,
            class: claim.class,
            spent_by: None,
            height: claim.state.height(),
            coinbase,
        });
        dirty.credit(outpoint);

        let base = claim_delta(claim.value, claim.class, confirmed);
        let account_delta = BalanceDelta {
            tx: first_touch as i64,
            ..base
        };
        tracing::debug!(
            wallet = self.wallet_id,
            tx = %claim.txid,
            vout = claim.vout,
            value = claim.value,
            confirmed,
            "retroactive claim"
        );
        self.apply_deltas(
            state,
            &[
                (BalanceKey::Account(claim.path.account), account_delta),
                (BalanceKey::Wallet, base),
            ],
            dirty,
        )
    }

    // ── Apply phase ─────────────────────────────────────────────────────

    /// Materialize credits for owned inputs known only through an inline
    /// coin view, then resolve the transaction's ownership view. Returns
    /// false when the wallet owns nothing in the transaction.
    fn apply_insert(
        &self,
        state: &mut WalletState,
        tx: &TxRecord,
        dirty: &mut Dirty,
    ) -> Result<bool, EngineError> {
        let txid = tx.txid();

        // Conflict check before any mutation: a credit claimed by another
        // journaled spender means the host must erase the conflict first.
        for input in &tx.inputs {
            if let Some(credit) = state.credits.get(&input.prevout) {
                if let Some(spender) = credit.spent_by {
                    if spender != txid {
                        return Err(EngineError::illegal(
                            txid,
                            format!("input {} already spent by {}", input.prevout, spender),
                        ));
                    }
                }
            }
        }

        self.materialize_coins(state, tx, dirty)?;
        let view = discovery::resolve_view(&state.book, &state.credits, tx);
        if view.is_empty() {
            return Ok(false);
        }

        let mut deltas = Vec::new();
        for account in view.accounts() {
            deltas.push((
                BalanceKey::Account(account),
                insert_delta(&view, Scope::Account(account), true),
            ));
        }
        deltas.push((
            BalanceKey::Wallet,
            insert_delta(&view, Scope::Wallet, true),
        ));

        for input in &view.inputs {
            state.credits.mark_spent(&input.prevout, txid);
            dirty.credit(input.prevout);
        }
        let coinbase = tx.is_coinbase();
        for output in &view.outputs {
            let outpoint = Outpoint::new(txid, output.vout);
            state.credits.insert(Credit {
                outpoint,
                value: output.value,
                path: output.path,
                class: output.class,
                spent_by: None,
                height: None,
                coinbase,
            });
            dirty.credit(outpoint);
        }

        state.journal.insert(tx.clone(), view, now_secs())?;
        dirty.entry(txid);
        self.apply_deltas(state, &deltas, dirty)
            .map(|_| true)
    }

    fn apply_confirm(
        &self,
        state: &mut WalletState,
        txid: TxId,
        height: u32,
        dirty: &mut Dirty,
    ) -> Result<(), EngineError> {
        let view = match state.journal.get(&txid) {
            Some(entry) => entry.owned.clone(),
            None => return Err(EngineError::illegal(txid, "unknown transaction")),
        };
        state.journal.set_confirmed(&txid, height)?;
        dirty.entry(txid);

        for output in &view.outputs {
            let outpoint = Outpoint::new(txid, output.vout);
            state.credits.set_height(&outpoint, Some(height));
            dirty.credit(outpoint);
        }

        let mut deltas = Vec::new();
        for account in view.accounts() {
            deltas.push((
                BalanceKey::Account(account),
                confirm_delta(&view, Scope::Account(account)),
            ));
        }
        deltas.push((
            BalanceKey::Wallet,
            confirm_delta(&view, Scope::Wallet),
        ));
        self.apply_deltas(state, &deltas, dirty)
    }

    fn apply_unconfirm(
        &self,
        state: &mut WalletState,
        txid: TxId,
        dirty: &mut Dirty,
    ) -> Result<(), EngineError> {
        let view = match state.journal.get(&txid) {
            Some(entry) => entry.owned.clone(),
            None => return Err(EngineError::illegal(txid, "unknown transaction")),
        };
        let height = state.journal.set_pending(&txid)?;
        dirty.entry(txid);

        for output in &view.outputs {
            let outpoint = Outpoint::new(txid, output.vout);
            state.credits.set_height(&outpoint, None);
            dirty.credit(outpoint);
        }

        let mut deltas = Vec::new();
        for account in view.accounts() {
            deltas.push((
                BalanceKey::Account(account),
                unconfirm_delta(&view, Scope::Account(account)),
            ));
        }
        deltas.push((
            BalanceKey::Wallet,
            unconfirm_delta(&view, Scope::Wallet),
        ));
        tracing::debug!(wallet = self.wallet_id, tx = %txid, height, "unconfirmed");
        self.apply_deltas(state, &deltas, dirty)
    }

    fn apply_erase(
        &self,
        state: &mut WalletState,
        txid: TxId,
        dirty: &mut Dirty,
    ) -> Result<(), EngineError> {
        let view = match state.journal.get(&txid) {
            Some(entry) if entry.is_pending() => entry.owned.clone(),
            Some(_) => {
                return Err(EngineError::illegal(
                    txid,
                    "cannot erase a confirmed transaction; unconfirm first",
                ))
            }
            None => return Err(EngineError::illegal(txid, "unknown transaction")),
        };
        // Refuse while descendants hold spends of this transaction's
        // outputs; the host erases children first (zap does so by order).
        for output in &view.outputs {
            let outpoint = Outpoint::new(txid, output.vout);
            if let Some(credit) = state.credits.get(&outpoint) {
                if let Some(spender) = credit.spent_by {
                    return Err(EngineError::illegal(
                        txid,
                        format!("output {} still spent by pending {}", outpoint, spender),
                    ));
                }
            }
        }

        state.journal.remove(&txid)?;
        dirty.remove_entry(txid);

        for output in &view.outputs {
            let outpoint = Outpoint::new(txid, output.vout);
            state.credits.remove(&outpoint);
            dirty.remove_credit(outpoint);
        }
        for input in &view.inputs {
            state.credits.mark_unspent(&input.prevout);
            dirty.credit(input.prevout);
        }

        let mut deltas = Vec::new();
        for account in view.accounts() {
            deltas.push((
                BalanceKey::Account(account),
                erase_delta(&view, Scope::Account(account), true),
            ));
        }
        deltas.push((
            BalanceKey::Wallet,
            erase_delta(&view, Scope::Wallet, true),
        ));
        tracing::debug!(wallet = self.wallet_id, tx = %txid, "erased");
        self.apply_deltas(state, &deltas, dirty)
    }

    /// The chain confirmed `tx`, so any pending transaction spending the
    /// same credits has become invalid: erase it (descendants first).
    /// A conflicting *confirmed* spend is a chain inconsistency and is
    /// reported instead.
    fn evict_conflicts(
        &self,
        state: &mut WalletState,
        tx: &TxRecord,
        txid: TxId,
        dirty: &mut Dirty,
    ) -> Result<(), EngineError> {
        for input in &tx.inputs {
            let Some(spender) = state.credits.get(&input.prevout).and_then(|c| c.spent_by)
            else {
                continue;
            };
            if spender == txid {
                continue;
            }
            let pending = state
                .journal
                .get(&spender)
                .map(|e| e.is_pending())
                .unwrap_or(false);
            if !pending {
                return Err(EngineError::illegal(
                    txid,
                    format!("input {} already spent by confirmed {}", input.prevout, spender),
                ));
            }
            tracing::warn!(
                wallet = self.wallet_id,
                conflict = %spender,
                winner = %txid,
                "evicting pending transaction conflicting with confirmation"
            );
            self.erase_recursive(state, spender, dirty)?;
        }
        Ok(())
    }

    /// Erase a pending transaction after erasing every pending descendant
    /// that spends one of its outputs.
    fn erase_recursive(
        &self,
        state: &mut WalletState,
        txid: TxId,
        dirty: &mut Dirty,
    ) -> Result<(), EngineError> {
        let outputs: Vec<Outpoint> = match state.journal.get(&txid) {
            Some(entry) => entry
                .owned
                .outputs
                .iter()
                .map(|o| Outpoint::new(txid, o.vout))
                .collect(),
            None => return Ok(()),
        };
        for outpoint in outputs {
            if let Some(spender) = state.credits.get(&outpoint).and_then(|c| c.spent_by) {
                if spender != txid {
                    self.erase_recursive(state, spender, dirty)?;
                }
            }
        }
        self.apply_erase(state, txid, dirty)
    }

    /// Create credits for owned inputs that have no recorded credit but do
    /// carry an inline coin. The claim delta credits the coin as gained
    /// knowledge; the ordinary insert delta then spends it.
    fn materialize_coins(
        &self,
        state: &mut WalletState,
        tx: &TxRecord,
        dirty: &mut Dirty,
    ) -> Result<(), EngineError> {
        for input in &tx.inputs {
            if state.credits.contains(&input.prevout) {
                continue;
            }
            let Some(coin) = &input.coin else {
                continue;
            };
            let Some(path) = state.book.owner_of(&coin.address) else {
                continue;
            };
            // Prefer the journal's view of the creating transaction when we
            // have one; otherwise trust the coin's height.
            let (height, journaled) = match state.journal.get(&input.prevout.txid) {
                Some(entry) => (entry.height(), true),
                None => (coin.height, false),
            };
            let class = classify(&coin.covenant);
            state.credits.insert(Credit {
                outpoint: input.prevout,
                value: coin.value,
                path,
                class,
                spent_by: None,
                height,
                coinbase: false,
            });
            dirty.credit(input.prevout);

            let base = claim_delta(coin.value, class, height.is_some());
            let mut account_delta = base;
            if journaled {
                if let Some(entry) = state.journal.get_mut(&input.prevout.txid) {
                    if !entry.owned.touches(path.account) {
                        account_delta.tx = 1;
                    }
                    entry.owned.outputs.push(OwnedOutput {
                        vout: input.prevout.vout,
                        path,
                        value: coin.value,
                        class,
                    });
                    entry.owned.outputs.sort_by_key(|o| o.vout);
                    dirty.entry(input.prevout.txid);
                }
            }
            tracing::debug!(
                wallet = self.wallet_id,
                outpoint = %input.prevout,
                value = coin.value,
                "materialized coin from inline view"
            );
            self.apply_deltas(
                state,
                &[
                    (BalanceKey::Account(path.account), account_delta),
                    (BalanceKey::Wallet, base),
                ],
                dirty,
            )?;
        }
        Ok(())
    }

    // ── Balance bookkeeping ─────────────────────────────────────────────

    /// Apply deltas to their scopes with underflow and containment checks.
    /// A failure quarantines the wallet.
    fn apply_deltas(
        &self,
        state: &mut WalletState,
        deltas: &[(BalanceKey, BalanceDelta)],
        dirty: &mut Dirty,
    ) -> Result<(), EngineError> {
        for (key, delta) in deltas {
            if delta.is_zero() {
                continue;
            }
            let current = state.balances.entry(*key).or_default();
            let next = match current.apply(delta).and_then(|next| {
                next.check_containment()?;
                Ok(next)
            }) {
                Ok(next) => next,
                Err(err) => {
                    state.quarantined = true;
                    tracing::error!(wallet = self.wallet_id, error = %err, "balance invariant broken, wallet quarantined");
                    return Err(err.into());
                }
            };
            *current = next;
            dirty.balances.insert(*key);
        }
        Ok(())
    }

    fn check_open(&self, state: &WalletState) -> Result<(), EngineError> {
        if state.quarantined {
            Err(EngineError::Quarantined)
        } else {
            Ok(())
        }
    }

    fn wallet_balance(&self, state: &WalletState) -> Balance {
        state
            .balances
            .get(&BalanceKey::Wallet)
            .copied()
            .unwrap_or_default()
    }

    /// Event epilogue: optional ground-truth verification, persistence,
    /// notification.
    fn finish_event(
        &self,
        state: &mut WalletState,
        dirty: Dirty,
        event: &'static str,
        txid: TxId,
    ) -> Result<Balance, EngineError> {
        let balance = self.finish(state, dirty)?;
        tracing::debug!(
            wallet = self.wallet_id,
            event,
            tx = %txid,
            tx_count = balance.tx,
            coin = balance.coin,
            confirmed = balance.confirmed,
            unconfirmed = balance.unconfirmed,
            locked_confirmed = balance.locked_confirmed,
            locked_unconfirmed = balance.locked_unconfirmed,
            "balances updated"
        );
        Ok(balance)
    }

    fn finish(&self, state: &mut WalletState, dirty: Dirty) -> Result<Balance, EngineError> {
        if self.config.verify_balances {
            self.verify(state)?;
        }
        self.persist(state, &dirty)?;
        Ok(self.wallet_balance(state))
    }

    /// Assert the incremental tuples against a from-scratch recomputation.
    fn verify(&self, state: &mut WalletState) -> Result<(), EngineError> {
        let recomputed = recompute(state);
        for (key, expected) in &recomputed {
            let cached = state.balances.get(key).copied().unwrap_or_default();
            if cached != *expected {
                state.quarantined = true;
                tracing::error!(
                    wallet = self.wallet_id,
                    scope = ?key,
                    ?cached,
                    ?expected,
                    "cached balance diverged from ground truth"
                );
                return Err(EngineError::InvariantViolation(format!(
                    "scope {key:?}: cached {cached:?} != recomputed {expected:?}"
                )));
            }
        }
        Ok(())
    }

    /// Flush the event's touched records. The single suspension point.
    fn persist(&self, state: &WalletState, dirty: &Dirty) -> Result<(), StoreError> {
        for id in &dirty.accounts {
            self.store.put_account(state.book.account(*id))?;
        }
        for outpoint in &dirty.removed_credits {
            self.store.delete_credit(outpoint)?;
        }
        for outpoint in &dirty.credits {
            if let Some(credit) = state.credits.get(outpoint) {
                self.store.put_credit(credit)?;
            }
        }
        for txid in &dirty.removed_journal {
            self.store.delete_journal_entry(txid)?;
        }
        for txid in &dirty.journal {
            if let Some(entry) = state.journal.get(txid) {
                self.store.put_journal_entry(entry)?;
            }
        }
        for key in &dirty.balances {
            let balance = state.balances.get(key).copied().unwrap_or_default();
            self.store.put_balance(*key, &balance)?;
        }
        self.store.flush()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, WalletState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, WalletState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ground-truth recomputation of every scope from the credit store and
/// journal. A credit's contribution is a function of its value, class,
/// height, and spender state alone.
fn recompute(state: &WalletState) -> HashMap<BalanceKey, Balance> {
    let mut balances: HashMap<BalanceKey, Balance> = HashMap::new();
    balances.insert(BalanceKey::Wallet, Balance::default());
    for account in state.book.accounts() {
        balances.insert(BalanceKey::Account(account.id), Balance::default());
    }

    for credit in state.credits.iter() {
        let spender_confirmed = credit
            .spent_by
            .map(|txid| {
                state
                    .journal
                    .get(&txid)
                    .map(|e| !e.is_pending())
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        let value = credit.value;
        let locked = credit.class.is_locked();
        let confirmed = credit.is_confirmed();
        let scopes = [BalanceKey::Wallet, BalanceKey::Account(credit.path.account)];

        for key in scopes {
            let balance = balances.entry(key).or_default();
            if credit.spent_by.is_none() {
                balance.coin += 1;
                balance.unconfirmed += value;
                if locked {
                    balance.locked_unconfirmed += value;
                }
                if confirmed {
                    balance.confirmed += value;
                    if locked {
                        balance.locked_confirmed += value;
                    }
                }
            } else if !spender_confirmed && confirmed {
                // Spent by a pending transaction: the unconfirmed columns
                // already dropped the value, the confirmed columns keep it
                // until the spend confirms.
                balance.confirmed += value;
                if locked {
                    balance.locked_confirmed += value;
                }
            }
        }
    }

    for entry in state.journal.iter() {
        balances.entry(BalanceKey::Wallet).or_default().tx += 1;
        for account in entry.owned.accounts() {
            balances.entry(BalanceKey::Account(account)).or_default().tx += 1;
        }
    }

    balances
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Coin, TxInput, TxOutput};
    use crate::covenant::{opcodes, Covenant};
    use crate::store::SledWalletStore;

    fn engine() -> WalletEngine {
        let store = Box::new(SledWalletStore::open_temporary().unwrap());
        WalletEngine::create(
            1,
            WalletSeed([5u8; 32]),
            EngineConfig::strict(5),
            store,
        )
        .unwrap()
    }

    fn receive_address(engine: &WalletEngine, index: u32) -> ScriptHash {
        let state = engine.read_state();
        let account = state.book.account_by_name("default").unwrap();
        account.derive(Branch::Receive, index)
    }

    fn coinbase_to(engine: &WalletEngine, value: u64, salt: u64) -> TxRecord {
        TxRecord::new(
            vec![],
            vec![TxOutput::plain(value, receive_address(engine, 0))],
        )
        .with_salt(salt)
    }

    #[test]
    fn insert_and_confirm_update_both_halves() {
        let engine = engine();
        let tx = coinbase_to(&engine, 10_000_000, 1);

        let after_insert = engine.insert_pending(&tx).unwrap();
        assert_eq!(after_insert.tx, 1);
        assert_eq!(after_insert.coin, 1);
        assert_eq!(after_insert.unconfirmed, 10_000_000);
        assert_eq!(after_insert.confirmed, 0);

        let after_confirm = engine.confirm(&tx, 1).unwrap();
        assert_eq!(after_confirm.confirmed, 10_000_000);
        assert_eq!(after_confirm.unconfirmed, 10_000_000);
    }

    #[test]
    fn irrelevant_tx_is_ignored() {
        let engine = engine();
        let tx = TxRecord::new(
            vec![],
            vec![TxOutput::plain(500, ScriptHash([0xAA; 32]))],
        );
        let balance = engine.insert_pending(&tx).unwrap();
        assert_eq!(balance, Balance::default());
        assert_eq!(engine.balance().tx, 0);
    }

    #[test]
    fn confirm_of_unknown_foreign_tx_is_illegal() {
        let engine = engine();
        let tx = TxRecord::new(
            vec![],
            vec![TxOutput::plain(500, ScriptHash([0xAA; 32]))],
        );
        match engine.confirm(&tx, 1) {
            Err(EngineError::IllegalTransition { .. }) => {}
            other => panic!("expected IllegalTransition, got {:?}", other),
        }
    }

    #[test]
    fn erase_of_confirmed_tx_is_illegal() {
        let engine = engine();
        let tx = coinbase_to(&engine, 1_000, 1);
        engine.insert_pending(&tx).unwrap();
        engine.confirm(&tx, 1).unwrap();
        match engine.erase(&tx.txid()) {
            Err(EngineError::IllegalTransition { .. }) => {}
            other => panic!("expected IllegalTransition, got {:?}", other),
        }
        // Unconfirm first, then erase works.
        engine.unconfirm(&tx.txid()).unwrap();
        let balance = engine.erase(&tx.txid()).unwrap();
        assert_eq!(balance, Balance::default());
    }

    #[test]
    fn double_spend_insert_is_rejected() {
        let engine = engine();
        let fund = coinbase_to(&engine, 5_000, 1);
        engine.insert_pending(&fund).unwrap();
        let prevout = Outpoint::new(fund.txid(), 0);

        let spend_a = TxRecord::new(
            vec![TxInput {
                prevout,
                coin: None,
            }],
            vec![TxOutput::plain(4_000, receive_address(&engine, 1))],
        )
        .with_salt(10);
        engine.insert_pending(&spend_a).unwrap();

        let spend_b = TxRecord::new(
            vec![TxInput {
                prevout,
                coin: None,
            }],
            vec![TxOutput::plain(4_000, receive_address(&engine, 2))],
        )
        .with_salt(11);
        match engine.insert_pending(&spend_b) {
            Err(EngineError::IllegalTransition { .. }) => {}
            other => panic!("expected IllegalTransition, got {:?}", other),
        }
    }

    #[test]
    fn inline_coin_materializes_confirmed_knowledge() {
        let engine = engine();
        // A spend of a coin the wallet has never seen, delivered with the
        // coin inline and paying to a foreign address: the coin's value
        // surfaces in the confirmed column, nothing else moves.
        let coin_address = receive_address(&engine, 0);
        let spend = TxRecord::new(
            vec![TxInput {
                prevout: Outpoint::new(TxId([7u8; 32]), 0),
                coin: Some(Coin {
                    value: 9_000,
                    address: coin_address,
                    covenant: Covenant::none(),
                    height: Some(4),
                }),
            }],
            vec![TxOutput::plain(8_000, ScriptHash([0xBB; 32]))],
        );
        let balance = engine.insert_pending(&spend).unwrap();
        assert_eq!(balance.tx, 1);
        assert_eq!(balance.coin, 0);
        assert_eq!(balance.unconfirmed, 0);
        assert_eq!(balance.confirmed, 9_000);
    }

    #[test]
    fn quarantine_blocks_events_until_recalculate() {
        let engine = engine();
        let tx = coinbase_to(&engine, 1_000, 1);
        engine.insert_pending(&tx).unwrap();
        {
            let mut state = engine.write_state();
            state.quarantined = true;
        }
        match engine.confirm(&tx, 1) {
            Err(EngineError::Quarantined) => {}
            other => panic!("expected Quarantined, got {:?}", other),
        }
        // Reads still serve the last consistent tuple.
        assert_eq!(engine.balance().unconfirmed, 1_000);
        engine.recalculate_balances().unwrap();
        engine.confirm(&tx, 1).unwrap();
        assert_eq!(engine.balance().confirmed, 1_000);
    }

    #[test]
    fn locked_bid_counts_in_locked_columns() {
        let engine = engine();
        let fund = coinbase_to(&engine, 10_000_000, 1);
        engine.insert_pending(&fund).unwrap();
        engine.confirm(&fund, 1).unwrap();

        let bid = TxRecord::new(
            vec![TxInput {
                prevout: Outpoint::new(fund.txid(), 0),
                coin: None,
            }],
            vec![
                TxOutput {
                    value: 1_000_000,
                    address: receive_address(&engine, 1),
                    covenant: Covenant::new(opcodes::BID, vec![]),
                },
                TxOutput::plain(8_990_000, receive_address(&engine, 2)),
            ],
        );
        let balance = engine.insert_pending(&bid).unwrap();
        assert_eq!(balance.locked_unconfirmed, 1_000_000);
        assert_eq!(balance.locked_confirmed, 0);
        assert_eq!(balance.unconfirmed, 9_990_000);
        assert_eq!(balance.confirmed, 10_000_000);

        let confirmed = engine.confirm(&bid, 2).unwrap();
        assert_eq!(confirmed.locked_confirmed, 1_000_000);
        assert_eq!(confirmed.confirmed, 9_990_000);
    }
}
