//! The coinview: the UTXO set with a rewindable history.
//!
//! Layered per the node's storage design: [`DurableCoinView`] keeps
//! entries, rewind records and the tip in the transactional KV;
//! [`CachedCoinView`] sits above it with an in-memory working set and
//! deferred flushing. Both expose the same [`CoinView`] contract.

mod cached;
mod durable;

pub use cached::CachedCoinView;
pub use durable::{DurableCoinView, COINVIEW_TABLES};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use xds_crypto::Hash;
use xds_primitives::{Transaction, TxOutput};

use crate::error::ChainError;

/// Unspent outputs of one transaction.
///
/// `outputs` is sparse: a spent position holds `None`. An entry whose
/// outputs are all spent is pruned from the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutputs {
    pub height: u64,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
    /// PoS transaction timestamp, used by kernel checks.
    pub time: u32,
    pub outputs: Vec<Option<TxOutput>>,
}

impl UnspentOutputs {
    pub fn from_transaction(tx: &Transaction, height: u64) -> Self {
        Self {
            height,
            is_coinbase: tx.is_coinbase(),
            is_coinstake: tx.is_coinstake(),
            time: tx.time,
            outputs: tx.outputs.iter().cloned().map(Some).collect(),
        }
    }

    pub fn output(&self, vout: u32) -> Option<&TxOutput> {
        self.outputs.get(vout as usize).and_then(Option::as_ref)
    }

    /// Mark one position spent, returning the spent output.
    pub fn spend(&mut self, vout: u32) -> Option<TxOutput> {
        self.outputs.get_mut(vout as usize).and_then(Option::take)
    }

    pub fn is_fully_spent(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    /// Coinbase and coinstake outputs are subject to maturity.
    pub fn requires_maturity(&self) -> bool {
        self.is_coinbase || self.is_coinstake
    }
}

/// The delta a connected block applies to the coinview.
///
/// `spends` reference only outputs that existed before the block; an
/// output both created and consumed inside the same block is netted
/// out by the producer (its position is already `None` in `created`),
/// so applying a delta never depends on intra-block ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinViewChanges {
    /// Outputs consumed by the block, in transaction order.
    pub spends: Vec<(Hash<32>, u32)>,
    /// Entries created by the block, in transaction order.
    pub created: Vec<(Hash<32>, UnspentOutputs)>,
}

impl CoinViewChanges {
    pub fn is_empty(&self) -> bool {
        self.spends.is_empty() && self.created.is_empty()
    }
}

/// Per-block delta needed to undo an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindData {
    /// Tip to return to.
    pub prev_block_hash: Hash<32>,
    /// Txids created by the block; their entries are deleted on rewind.
    pub to_remove: Vec<Hash<32>>,
    /// Pre-spend snapshots of every entry the block modified.
    pub to_restore: Vec<(Hash<32>, UnspentOutputs)>,
}

/// Current tip of the coinview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinViewTip {
    pub hash: Hash<32>,
    pub height: u64,
}

/// Map returned by `fetch`: a missing key decodes as `None` (absent).
pub type FetchedCoins = HashMap<Hash<32>, Option<UnspentOutputs>>;

/// UTXO set with atomic apply and exact-inverse rewind.
pub trait CoinView: Send + Sync {
    /// Current entries for the given txids; absent txids map to `None`.
    fn fetch(&self, txids: &[Hash<32>]) -> Result<FetchedCoins, ChainError>;

    /// Atomically apply a block's changes and advance the tip.
    ///
    /// `prev_hash` must equal the current tip; a mismatch is an
    /// invariant violation and aborts the node.
    fn apply(
        &self,
        block_hash: Hash<32>,
        prev_hash: Hash<32>,
        changes: CoinViewChanges,
    ) -> Result<(), ChainError>;

    /// Undo the most recent apply, returning the new tip hash.
    fn rewind(&self) -> Result<Hash<32>, ChainError>;

    fn tip(&self) -> Result<CoinViewTip, ChainError>;
}

/// Number of rewind records that must stay available.
pub const REWIND_WINDOW: u64 = 125;


#[cfg(test)]
mod tests {
    use super::*;
    use testutil::*;

    #[test]
    fn entry_tracks_spent_positions() {
        let (_, mut entry) = entry(3, 3);

        assert!(!entry.is_fully_spent());
        assert!(entry.output(1).is_some());

        let spent = entry.spend(1).unwrap();
        assert_eq!(spent.value, 2_000_000);
        assert!(entry.output(1).is_none());

        entry.spend(0);
        entry.spend(2);
        assert!(entry.is_fully_spent());
    }

    #[test]
    fn spend_out_of_range_is_none() {
        let (_, mut entry) = entry(3, 1);
        assert!(entry.spend(5).is_none());
    }
}
