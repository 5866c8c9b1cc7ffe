//! Accounts, deterministic address derivation, and the gap-limit address book.
//!
//! A wallet owns a set of accounts; each account owns two derivation
//! branches (receive and change) with a depth counter and a fixed lookahead
//! window. The address book maps script hashes back to the key path that
//! derived them — that lookup is the engine's only notion of ownership.
//!
//! Real key derivation is an external collaborator. Here an address is a
//! domain-separated hash of `(account seed, branch, index)`; determinism is
//! the contract the rest of the engine relies on, not the cryptography.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::chain::ScriptHash;
use crate::constants;

/// Errors from account and address-book operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AccountError {
    #[error("account {0:?} already exists")]
    Exists(String),
    #[error("unknown account {0:?}")]
    Unknown(String),
    #[error("account limit reached ({0})")]
    TooManyAccounts(usize),
    #[error("lookahead exhausted for account {account:?}: depth ceiling {ceiling} reached")]
    LookaheadExhausted { account: String, ceiling: u32 },
}

/// Index of an account within its wallet.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AccountId(pub u32);

/// Derivation branch of an address.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Branch {
    Receive,
    Change,
}

impl Branch {
    fn tag(self) -> u8 {
        match self {
            Branch::Receive => 0,
            Branch::Change => 1,
        }
    }
}

/// The derivation coordinates of an owned address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPath {
    pub account: AccountId,
    pub branch: Branch,
    pub index: u32,
}

/// Wallet master seed. Account seeds are derived from it by name, which is
/// what makes `rescan` from a fresh wallet with the same seed reproduce the
/// original wallet.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct WalletSeed(pub [u8; 32]);

impl WalletSeed {
    pub fn random() -> Self {
        WalletSeed(rand::random())
    }

    pub fn account_seed(&self, name: &str) -> AccountSeed {
        let mut data = Vec::with_capacity(32 + name.len());
        data.extend_from_slice(&self.0);
        data.extend_from_slice(name.as_bytes());
        AccountSeed(crate::hash_domain(b"sable.account-seed", &data))
    }
}

impl std::fmt::Debug for WalletSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WalletSeed(..)")
    }
}

/// Per-account derivation seed.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AccountSeed(pub [u8; 32]);

impl std::fmt::Debug for AccountSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccountSeed(..)")
    }
}

/// Persistent account metadata. Everything else about an account (the
/// derived lookup) is rebuilt from this record on open.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub seed: AccountSeed,
    pub receive_depth: u32,
    pub change_depth: u32,
    pub lookahead: u32,
}

impl Account {
    /// Derive the script hash at `(branch, index)`.
    pub fn derive(&self, branch: Branch, index: u32) -> ScriptHash {
        let mut data = [0u8; 37];
        data[..32].copy_from_slice(&self.seed.0);
        data[32] = branch.tag();
        data[33..].copy_from_slice(&index.to_le_bytes());
        ScriptHash(crate::hash_domain(b"sable.address", &data))
    }

    pub fn depth(&self, branch: Branch) -> u32 {
        match branch {
            Branch::Receive => self.receive_depth,
            Branch::Change => self.change_depth,
        }
    }

    fn depth_mut(&mut self, branch: Branch) -> &mut u32 {
        match branch {
            Branch::Receive => &mut self.receive_depth,
            Branch::Change => &mut self.change_depth,
        }
    }

    /// One past the highest index currently recognized on `branch`.
    pub fn window_end(&self, branch: Branch) -> u32 {
        self.depth(branch).saturating_add(self.lookahead)
    }
}

/// Script-hash → key-path lookup across all accounts of one wallet.
pub struct AddressBook {
    accounts: Vec<Account>,
    by_name: HashMap<String, AccountId>,
    paths: HashMap<ScriptHash, KeyPath>,
    /// One past the highest derived index per `(account, branch)`, so window
    /// extensions never re-derive from zero.
    derived: HashMap<(AccountId, Branch), u32>,
    ceiling: u32,
}

impl AddressBook {
    pub fn new(ceiling: u32) -> Self {
        AddressBook {
            accounts: Vec::new(),
            by_name: HashMap::new(),
            paths: HashMap::new(),
            derived: HashMap::new(),
            ceiling,
        }
    }

    /// Register a new account and pre-derive its initial window on both
    /// branches.
    pub fn create_account(
        &mut self,
        name: &str,
        seed: AccountSeed,
        lookahead: u32,
    ) -> Result<AccountId, AccountError> {
        if self.by_name.contains_key(name) {
            return Err(AccountError::Exists(name.to_string()));
        }
        if self.accounts.len() >= constants::MAX_ACCOUNTS {
            return Err(AccountError::TooManyAccounts(constants::MAX_ACCOUNTS));
        }
        let id = AccountId(self.accounts.len() as u32);
        self.accounts.push(Account {
            id,
            name: name.to_string(),
            seed,
            receive_depth: 0,
            change_depth: 0,
            lookahead,
        });
        self.by_name.insert(name.to_string(), id);
        for branch in [Branch::Receive, Branch::Change] {
            let end = self.accounts[id.0 as usize].window_end(branch);
            if end > 0 {
                self.ensure_index(id, branch, end - 1);
            }
        }
        Ok(id)
    }

    /// Re-register a persisted account, rebuilding its derived lookup up to
    /// the recorded depth plus lookahead.
    pub fn restore_account(&mut self, account: Account) -> Result<AccountId, AccountError> {
        if self.by_name.contains_key(&account.name) {
            return Err(AccountError::Exists(account.name));
        }
        let id = account.id;
        self.by_name.insert(account.name.clone(), id);
        if self.accounts.len() <= id.0 as usize {
            self.accounts.resize_with(id.0 as usize + 1, || Account {
                id: AccountId(u32::MAX),
                name: String::new(),
                seed: AccountSeed([0u8; 32]),
                receive_depth: 0,
                change_depth: 0,
                lookahead: 0,
            });
        }
        self.accounts[id.0 as usize] = account;
        for branch in [Branch::Receive, Branch::Change] {
            let end = self.accounts[id.0 as usize].window_end(branch);
            if end > 0 {
                self.ensure_index(id, branch, end - 1);
            }
        }
        Ok(id)
    }

    pub fn account(&self, id: AccountId) -> &Account {
        &self.accounts[id.0 as usize]
    }

    pub fn account_by_name(&self, name: &str) -> Option<&Account> {
        self.by_name.get(name).map(|id| self.account(*id))
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Resolve an output's owner. O(1); returns `None` for foreign scripts.
    pub fn owner_of(&self, address: &ScriptHash) -> Option<KeyPath> {
        self.paths.get(address).copied()
    }

    /// Derive and register addresses on `branch` up to `index` inclusive.
    /// Idempotent; indices already derived are skipped.
    pub fn ensure_index(&mut self, id: AccountId, branch: Branch, index: u32) {
        let start = self.derived.get(&(id, branch)).copied().unwrap_or(0);
        if index < start {
            return;
        }
        let account = &self.accounts[id.0 as usize];
        for i in start..=index {
            let hash = account.derive(branch, i);
            self.paths.insert(
                hash,
                KeyPath {
                    account: id,
                    branch,
                    index: i,
                },
            );
        }
        self.derived.insert((id, branch), index + 1);
    }

    /// Record that an owned output was observed at `index`: raise the branch
    /// depth to `index + 1` and extend the derived lookup to cover the new
    /// window. Returns whether the depth actually moved.
    ///
    /// After `advance_depth(_, _, i)`, `owner_of` recognizes every address
    /// of the branch with index ≤ `i + lookahead`.
    pub fn advance_depth(
        &mut self,
        id: AccountId,
        branch: Branch,
        index: u32,
    ) -> Result<bool, AccountError> {
        let account = &self.accounts[id.0 as usize];
        let current = account.depth(branch);
        let target = index.saturating_add(1);
        if target <= current {
            return Ok(false);
        }
        if target > self.ceiling {
            return Err(AccountError::LookaheadExhausted {
                account: account.name.clone(),
                ceiling: self.ceiling,
            });
        }
        *self.accounts[id.0 as usize].depth_mut(branch) = target;
        let end = self.accounts[id.0 as usize].window_end(branch);
        self.ensure_index(id, branch, end - 1);
        Ok(true)
    }
}
