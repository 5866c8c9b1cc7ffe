//! # Sable
//!
//! A deterministic wallet-accounting engine for a UTXO chain with a
//! name-auction covenant system:
//! - **Six-tuple balances** — `(tx, coin, confirmed, unconfirmed, locked confirmed,
//!   locked unconfirmed)` maintained per account and per wallet
//! - **Covenant lock accounting** — BID/REVEAL/name outputs contribute to the
//!   locked columns until the auction releases them
//! - **Strict invertibility** — every ingestion event (pending insert, confirm,
//!   unconfirm, erase) is reversible bit-exactly, which is what makes reorg
//!   replay safe
//! - **Gap-limit discovery** — outputs beyond the lookahead window are claimed
//!   retroactively once the receive depth advances past them
//! - **Ground-truth recomputation** — every cached tuple can be rebuilt from
//!   the credit store alone and checked against the incremental value
//!
//! The engine is a library: signing, key cryptography, address encoding, the
//! mempool, and the chain itself are external collaborators. The host feeds
//! events through [`engine::WalletEngine`] and reads balances back.

pub mod account;
pub mod balance;
pub mod chain;
pub mod config;
pub mod covenant;
pub mod credit;
pub mod discovery;
pub mod engine;
pub mod journal;
pub mod store;

/// Engine-wide constants.
pub mod constants {
    /// Default gap-limit window: how far past the receive depth incoming
    /// outputs are still recognized.
    pub const DEFAULT_LOOKAHEAD: u32 = 10;
    /// Default ceiling on derivation depth. Advancing past this surfaces
    /// `LookaheadExhausted` and halts further discovery.
    pub const DEFAULT_LOOKAHEAD_CEILING: u32 = 1 << 20;
    /// Account index of the default account every wallet starts with.
    pub const DEFAULT_ACCOUNT: &str = "default";
    /// Hard cap on accounts per wallet. The address-book lookup is shared
    /// across accounts, so this bounds worst-case derivation work.
    pub const MAX_ACCOUNTS: usize = 1 << 16;
}

/// 32-byte hash used throughout the engine.
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all Sable domains use ASCII).
/// Panics at runtime if domain is not valid UTF-8 — this is a programming error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute a domain-separated BLAKE3 hash over length-prefixed parts.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`). Transaction
/// ids are built through this. Same domain contract as [`hash_domain`].
pub fn hash_parts(domain: &[u8], parts: &[&[u8]]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_parts: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Serialize a value with bincode. Store encoding for every record family.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

/// Deserialize a bincode-encoded value.
pub fn deserialize<'a, T: serde::Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_domain_separates() {
        let a = hash_domain(b"sable.a", b"payload");
        let b = hash_domain(b"sable.b", b"payload");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_parts_is_unambiguous() {
        let a = hash_parts(b"sable.test", &[b"AB", b"C"]);
        let b = hash_parts(b"sable.test", &[b"A", b"BC"]);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_parts_separates_domains() {
        let a = hash_parts(b"sable.a", &[b"payload"]);
        let b = hash_parts(b"sable.b", &[b"payload"]);
        assert_ne!(a, b);
    }
}
