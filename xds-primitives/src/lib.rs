//! Ledger primitives for the XDS chain: transactions, blocks, proven
//! headers and the constants that parameterize consensus.

pub mod block;
pub mod merkle;
pub mod params;
pub mod proven;
pub mod target;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use params::NetworkParams;
pub use proven::{MerklePath, ProvenHeader};
pub use target::CompactTarget;
pub use transaction::{OutPoint, Transaction, TxInput, TxOutput};

/// Smallest monetary unit per coin.
pub const COIN: i64 = 100_000_000;

/// Syntactic upper bound on any amount. The chain deliberately keeps
/// the signed 64-bit maximum here instead of a supply-derived cap.
pub const MAX_MONEY: i64 = i64::MAX;

/// Monetary amount in satoshi.
pub type Amount = i64;

/// `true` when the amount is syntactically valid.
pub fn money_range(amount: Amount) -> bool {
    (0..=MAX_MONEY).contains(&amount)
}
