//! Chain-facing data model.
//!
//! The engine consumes transactions and blocks as plain data. It never
//! validates consensus rules; the chain view it is fed is trusted. Inputs
//! may optionally carry the spent output inline (a "coin view") so the
//! engine can recognize spends of outputs it has no credit for.

use serde::{Deserialize, Serialize};

use crate::covenant::Covenant;

/// A unique transaction identifier (hash of the serialized transaction).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxId(pub crate::Hash);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A reference to a transaction output.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Outpoint {
    pub txid: TxId,
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: TxId, vout: u32) -> Self {
        Outpoint { txid, vout }
    }
}

impl std::fmt::Display for Outpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A script hash identifying an address. Two addresses are the same iff
/// their script hashes match.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ScriptHash(pub crate::Hash);

/// A previously-created output, as supplied inline by a coin view.
///
/// `height` is the confirmation height of the transaction that created the
/// coin, or `None` if it is still pending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub value: u64,
    pub address: ScriptHash,
    pub covenant: Covenant,
    pub height: Option<u32>,
}

/// A transaction input: the outpoint it spends, plus the spent coin when the
/// host can supply one. Without a recorded credit and without an inline
/// coin, the input is conservatively treated as foreign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prevout: Outpoint,
    pub coin: Option<Coin>,
}

/// A transaction output: a value bound to an address under a covenant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub address: ScriptHash,
    pub covenant: Covenant,
}

impl TxOutput {
    pub fn plain(value: u64, address: ScriptHash) -> Self {
        TxOutput {
            value,
            address,
            covenant: Covenant::none(),
        }
    }
}

/// A transaction as the engine sees it.
///
/// The id is the domain-separated hash of the bincode encoding. The inline
/// coins on inputs are excluded from the id so that attaching a coin view
/// does not change a transaction's identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Disambiguates otherwise-identical transactions in fixtures and
    /// coinbases; carried in the id preimage.
    pub salt: u64,
}

impl TxRecord {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        TxRecord {
            inputs,
            outputs,
            salt: 0,
        }
    }

    pub fn with_salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    /// Compute the transaction id: the domain-separated hash of the
    /// length-prefixed preimage parts.
    pub fn txid(&self) -> TxId {
        let mut parts: Vec<Vec<u8>> = Vec::new();
        parts.push(self.salt.to_le_bytes().to_vec());
        parts.push((self.inputs.len() as u32).to_le_bytes().to_vec());
        for input in &self.inputs {
            parts.push(input.prevout.txid.0.to_vec());
            parts.push(input.prevout.vout.to_le_bytes().to_vec());
        }
        parts.push((self.outputs.len() as u32).to_le_bytes().to_vec());
        for output in &self.outputs {
            parts.push(output.value.to_le_bytes().to_vec());
            parts.push(output.address.0.to_vec());
            parts.push(vec![output.covenant.action]);
            parts.push((output.covenant.items.len() as u32).to_le_bytes().to_vec());
            for item in &output.covenant.items {
                parts.push(item.clone());
            }
        }
        let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        TxId(crate::hash_parts(b"sable.txid", &refs))
    }

    /// A transaction with no inputs is a coinbase.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// The transactions of one block, in block order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockData {
    pub height: u32,
    pub txs: Vec<TxRecord>,
}

/// Read-only view of the active chain, supplied by the host for rescan.
pub trait ChainView {
    /// Block data at `height`, or `None` past the tip.
    fn block(&self, height: u32) -> Option<BlockData>;
    /// Height of the chain tip.
    fn tip(&self) -> u32;
}

/// In-memory chain view over a vector of blocks. Primarily for tests and
/// for hosts that assemble the replay window up front.
#[derive(Clone, Debug, Default)]
pub struct MemoryChain {
    blocks: Vec<BlockData>,
}

impl MemoryChain {
    pub fn new() -> Self {
        MemoryChain { blocks: Vec::new() }
    }

    /// Append a block at the next height and return that height.
    pub fn push(&mut self, txs: Vec<TxRecord>) -> u32 {
        let height = self.blocks.len() as u32;
        self.blocks.push(BlockData { height, txs });
        height
    }

    /// Drop all blocks above `height`, mirroring a reorg.
    pub fn truncate(&mut self, height: u32) {
        self.blocks.truncate(height as usize + 1);
    }
}

impl ChainView for MemoryChain {
    fn block(&self, height: u32) -> Option<BlockData> {
        self.blocks.get(height as usize).cloned()
    }

    fn tip(&self) -> u32 {
        (self.blocks.len() as u32).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(byte: u8) -> ScriptHash {
        ScriptHash([byte; 32])
    }

    #[test]
    fn txid_ignores_inline_coins() {
        let prevout = Outpoint::new(TxId([9u8; 32]), 0);
        let bare = TxRecord::new(
            vec![TxInput {
                prevout,
                coin: None,
            }],
            vec![TxOutput::plain(50, script(1))],
        );
        let with_coin = TxRecord::new(
            vec![TxInput {
                prevout,
                coin: Some(Coin {
                    value: 60,
                    address: script(2),
                    covenant: Covenant::none(),
                    height: Some(3),
                }),
            }],
            vec![TxOutput::plain(50, script(1))],
        );
        assert_eq!(bare.txid(), with_coin.txid());
    }

    #[test]
    fn txid_changes_with_salt() {
        let tx = TxRecord::new(vec![], vec![TxOutput::plain(50, script(1))]);
        let salted = tx.clone().with_salt(7);
        assert_ne!(tx.txid(), salted.txid());
    }

    #[test]
    fn memory_chain_roundtrip() {
        let mut chain = MemoryChain::new();
        chain.push(vec![]);
        chain.push(vec![TxRecord::new(vec![], vec![TxOutput::plain(1, script(1))])]);
        assert_eq!(chain.tip(), 1);
        assert_eq!(chain.block(1).unwrap().txs.len(), 1);
        chain.truncate(0);
        assert_eq!(chain.tip(), 0);
        assert!(chain.block(1).is_none());
    }
}
