//! Covenant model and classifier.
//!
//! An output's covenant is the script-level annotation that drives the
//! name-auction state machine (OPEN → BID → REVEAL → REDEEM, REGISTER →
//! UPDATE / RENEW / TRANSFER → FINALIZE / REVOKE). The engine never executes
//! covenants; it only needs to know whether an output's value is spendable,
//! locked in the auction, or burned. `classify` is the single place raw
//! covenant opcodes are read.

use serde::{Deserialize, Serialize};

/// Raw covenant action opcodes as they appear on the wire.
pub mod opcodes {
    pub const NONE: u8 = 0;
    pub const OPEN: u8 = 1;
    pub const BID: u8 = 2;
    pub const REVEAL: u8 = 3;
    pub const REDEEM: u8 = 4;
    pub const REGISTER: u8 = 5;
    pub const UPDATE: u8 = 6;
    pub const RENEW: u8 = 7;
    pub const TRANSFER: u8 = 8;
    pub const FINALIZE: u8 = 9;
    pub const REVOKE: u8 = 10;
}

/// A covenant attached to a transaction output.
///
/// `action` is the raw opcode; `items` carries the opaque script operands
/// (name hashes, blinds, record data). The engine treats the items as bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Covenant {
    pub action: u8,
    pub items: Vec<Vec<u8>>,
}

impl Covenant {
    pub fn none() -> Self {
        Covenant::default()
    }

    pub fn new(action: u8, items: Vec<Vec<u8>>) -> Self {
        Covenant { action, items }
    }
}

/// Semantic bucket an output's value falls into for balance accounting.
///
/// The closed set of classes is the only covenant knowledge the rest of the
/// engine has. Every class other than `Burn` is an ordinary spendable credit;
/// the `Locked*` auction classes additionally contribute to the locked
/// balance columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovenantClass {
    /// Plain payment output, or a REDEEM returning a losing bid.
    None,
    /// Output of an auction OPEN. Its value is zero by consensus rule, and
    /// the class is excluded from the locked columns, so it contributes to
    /// the sums exactly like `None`. We still materialize a credit for it so
    /// `coin` counts it.
    LockedOpen,
    /// A sealed bid: value is the blind (bid plus mask), locked until REVEAL.
    LockedBid,
    /// A revealed bid: value is the true bid, locked until REDEEM or REGISTER.
    LockedReveal,
    /// A won name (REGISTER/UPDATE/RENEW/TRANSFER/FINALIZE): value stays
    /// locked while the name is held.
    LockedName,
    /// A revoked name. The value is burned on chain; this engine keeps the
    /// credit as a normal entry rather than discounting it.
    Burn,
}

impl CovenantClass {
    /// Whether credits of this class contribute to `locked_confirmed` /
    /// `locked_unconfirmed`.
    pub fn is_locked(self) -> bool {
        matches!(
            self,
            CovenantClass::LockedBid | CovenantClass::LockedReveal | CovenantClass::LockedName
        )
    }
}

/// Map a covenant to its balance class.
///
/// Total and deterministic: depends only on the covenant's opcode. Unknown
/// opcodes degrade to `None` with a warning rather than aborting the event;
/// the chain view is trusted, so an unknown opcode means this build is older
/// than the network, not that the output is unspendable.
pub fn classify(covenant: &Covenant) -> CovenantClass {
    match covenant.action {
        opcodes::NONE | opcodes::REDEEM => CovenantClass::None,
        opcodes::OPEN => CovenantClass::LockedOpen,
        opcodes::BID => CovenantClass::LockedBid,
        opcodes::REVEAL => CovenantClass::LockedReveal,
        opcodes::REGISTER
        | opcodes::UPDATE
        | opcodes::RENEW
        | opcodes::TRANSFER
        | opcodes::FINALIZE => CovenantClass::LockedName,
        opcodes::REVOKE => CovenantClass::Burn,
        unknown => {
            tracing::warn!(opcode = unknown, "unknown covenant action, treating as spendable");
            CovenantClass::None
        }
    }
}
