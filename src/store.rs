//! Persistent storage for wallet accounting state.
//!
//! Provides a `WalletStore` trait and a sled-backed implementation for
//! persisting account metadata, credits, journal entries, and the cached
//! balance per scope. Every record is also reconstructible from the chain
//! plus the account seeds via `rescan`; the store exists so a reopened
//! wallet does not have to replay the chain.

use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountId};
use crate::balance::Balance;
use crate::chain::{Outpoint, TxId};
use crate::credit::Credit;
use crate::journal::JournalEntry;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Key of a cached balance record.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BalanceKey {
    Wallet,
    Account(AccountId),
}

/// Trait for wallet persistence backends.
pub trait WalletStore: Send + Sync {
    fn put_account(&self, account: &Account) -> Result<(), StoreError>;
    fn load_accounts(&self) -> Result<Vec<Account>, StoreError>;

    fn put_credit(&self, credit: &Credit) -> Result<(), StoreError>;
    fn delete_credit(&self, outpoint: &Outpoint) -> Result<(), StoreError>;
    fn load_credits(&self) -> Result<Vec<Credit>, StoreError>;

    fn put_journal_entry(&self, entry: &JournalEntry) -> Result<(), StoreError>;
    fn delete_journal_entry(&self, txid: &TxId) -> Result<(), StoreError>;
    fn load_journal(&self) -> Result<Vec<JournalEntry>, StoreError>;

    fn put_balance(&self, key: BalanceKey, balance: &Balance) -> Result<(), StoreError>;
    fn load_balances(&self) -> Result<Vec<(BalanceKey, Balance)>, StoreError>;

    /// Durability point: called once at the end of every event handler.
    fn flush(&self) -> Result<(), StoreError>;
}

/// Sled-backed wallet store.
pub struct SledWalletStore {
    #[allow(dead_code)]
    db: sled::Db,
    accounts: sled::Tree,
    credits: sled::Tree,
    journal: sled::Tree,
    balances: sled::Tree,
}

impl SledWalletStore {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StoreError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let accounts = db
            .open_tree("accounts")
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let credits = db
            .open_tree("credits")
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let journal = db
            .open_tree("journal")
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let balances = db
            .open_tree("balances")
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(SledWalletStore {
            db,
            accounts,
            credits,
            journal,
            balances,
        })
    }
}

fn outpoint_key(outpoint: &Outpoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.txid.0);
    key[32..].copy_from_slice(&outpoint.vout.to_be_bytes());
    key
}

fn balance_key(key: BalanceKey) -> [u8; 5] {
    match key {
        BalanceKey::Wallet => [0xff; 5],
        BalanceKey::Account(id) => {
            let mut bytes = [0u8; 5];
            bytes[1..].copy_from_slice(&id.0.to_be_bytes());
            bytes
        }
    }
}

fn decode_balance_key(bytes: &[u8]) -> Result<BalanceKey, StoreError> {
    match bytes {
        [0xff, 0xff, 0xff, 0xff, 0xff] => Ok(BalanceKey::Wallet),
        [0, a, b, c, d] => Ok(BalanceKey::Account(AccountId(u32::from_be_bytes([
            *a, *b, *c, *d,
        ])))),
        other => Err(StoreError::Serialization(format!(
            "bad balance key: {}",
            hex::encode(other)
        ))),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    crate::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    crate::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl WalletStore for SledWalletStore {
    fn put_account(&self, account: &Account) -> Result<(), StoreError> {
        self.accounts
            .insert(account.id.0.to_be_bytes(), encode(account)?)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn load_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let mut accounts = Vec::new();
        for item in self.accounts.iter() {
            let (_, value) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            accounts.push(decode(&value)?);
        }
        Ok(accounts)
    }

    fn put_credit(&self, credit: &Credit) -> Result<(), StoreError> {
        self.credits
            .insert(outpoint_key(&credit.outpoint), encode(credit)?)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn delete_credit(&self, outpoint: &Outpoint) -> Result<(), StoreError> {
        self.credits
            .remove(outpoint_key(outpoint))
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn load_credits(&self) -> Result<Vec<Credit>, StoreError> {
        let mut credits = Vec::new();
        for item in self.credits.iter() {
            let (_, value) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            credits.push(decode(&value)?);
        }
        Ok(credits)
    }

    fn put_journal_entry(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        self.journal
            .insert(entry.txid.0, encode(entry)?)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn delete_journal_entry(&self, txid: &TxId) -> Result<(), StoreError> {
        self.journal
            .remove(txid.0)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn load_journal(&self) -> Result<Vec<JournalEntry>, StoreError> {
        let mut entries = Vec::new();
        for item in self.journal.iter() {
            let (_, value) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    fn put_balance(&self, key: BalanceKey, balance: &Balance) -> Result<(), StoreError> {
        self.balances
            .insert(balance_key(key), encode(balance)?)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn load_balances(&self) -> Result<Vec<(BalanceKey, Balance)>, StoreError> {
        let mut balances = Vec::new();
        for item in self.balances.iter() {
            let (key, value) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            balances.push((decode_balance_key(&key)?, decode(&value)?));
        }
        Ok(balances)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountSeed, Branch, KeyPath};
    use crate::covenant::CovenantClass;

    fn sample_credit() -> Credit {
        Credit {
            outpoint: Outpoint::new(TxId([1u8; 32]), 2),
            value: 5_000,
            path: KeyPath {
                account: AccountId(0),
                branch: Branch::Receive,
                index: 3,
            },
            class: CovenantClass::LockedBid,
            spent_by: None,
            height: Some(7),
            coinbase: false,
        }
    }

    #[test]
    fn credit_roundtrip() {
        let store = SledWalletStore::open_temporary().unwrap();
        let credit = sample_credit();
        store.put_credit(&credit).unwrap();
        assert_eq!(store.load_credits().unwrap(), vec![credit.clone()]);
        store.delete_credit(&credit.outpoint).unwrap();
        assert!(store.load_credits().unwrap().is_empty());
    }

    #[test]
    fn account_roundtrip() {
        let store = SledWalletStore::open_temporary().unwrap();
        let account = Account {
            id: AccountId(1),
            name: "alt".into(),
            seed: AccountSeed([9u8; 32]),
            receive_depth: 4,
            change_depth: 2,
            lookahead: 10,
        };
        store.put_account(&account).unwrap();
        let loaded = store.load_accounts().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "alt");
        assert_eq!(loaded[0].receive_depth, 4);
    }

    #[test]
    fn balance_keys_roundtrip() {
        let store = SledWalletStore::open_temporary().unwrap();
        let wallet = Balance {
            tx: 3,
            coin: 2,
            confirmed: 100,
            unconfirmed: 150,
            locked_confirmed: 10,
            locked_unconfirmed: 20,
        };
        store.put_balance(BalanceKey::Wallet, &wallet).unwrap();
        store
            .put_balance(BalanceKey::Account(AccountId(2)), &Balance::default())
            .unwrap();
        let mut loaded = store.load_balances().unwrap();
        loaded.sort_by_key(|(key, _)| matches!(key, BalanceKey::Wallet));
        assert_eq!(loaded[0].0, BalanceKey::Account(AccountId(2)));
        assert_eq!(loaded[1].1, wallet);
    }
}
