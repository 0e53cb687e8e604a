//! KV-backed coinview.

use std::sync::Mutex;

use tracing::{debug, instrument, trace};
use xds_crypto::Hash;
use xds_storage::{DbHash, DbInt, DbSerde, KvTable, KvStore, SharedKv, WriteBatch};

use crate::error::ChainError;

use super::{
    CoinView, CoinViewChanges, CoinViewTip, FetchedCoins, RewindData, UnspentOutputs,
    REWIND_WINDOW,
};

struct UtxoTable;

impl KvTable for UtxoTable {
    const NAME: &'static str = "utxo";
    type Key = DbHash;
    type Value = DbSerde<UnspentOutputs>;
}

struct RewindTable;

impl KvTable for RewindTable {
    const NAME: &'static str = "rewind";
    type Key = DbInt;
    type Value = DbSerde<RewindData>;
}

struct TipTable;

impl KvTable for TipTable {
    const NAME: &'static str = "coinview_tip";
    type Key = DbInt;
    type Value = DbSerde<CoinViewTip>;
}

const TIP_KEY: u64 = 0;

/// Tables this view expects the KV store to provide.
pub const COINVIEW_TABLES: &[&str] = &[UtxoTable::NAME, RewindTable::NAME, TipTable::NAME];

/// Coinview persisted in the transactional KV.
///
/// Every `apply`/`rewind` is one atomic batch: entries, the rewind
/// record and the tip move together or not at all.
pub struct DurableCoinView {
    kv: SharedKv,
    /// Serializes writers; reads go straight to the KV.
    write_lock: Mutex<()>,
}

impl DurableCoinView {
    /// Open over `kv`, initializing the tip to the genesis hash when
    /// the store is empty.
    pub fn open(kv: SharedKv, genesis_hash: Hash<32>) -> Result<Self, ChainError> {
        if TipTable::get(kv.as_ref(), DbInt(TIP_KEY))?.is_none() {
            let mut batch = WriteBatch::new();
            TipTable::stage_put(
                &mut batch,
                DbInt(TIP_KEY),
                DbSerde(CoinViewTip {
                    hash: genesis_hash,
                    height: 0,
                }),
            )?;
            kv.commit(batch)?;
            debug!(%genesis_hash, "initialized empty coinview");
        }

        Ok(Self {
            kv,
            write_lock: Mutex::new(()),
        })
    }

    fn read_tip(&self) -> Result<CoinViewTip, ChainError> {
        TipTable::get(self.kv.as_ref(), DbInt(TIP_KEY))?
            .map(|DbSerde(tip)| tip)
            .ok_or_else(|| ChainError::invariant("coinview tip record is missing"))
    }

    fn read_rewind(&self, height: u64) -> Result<Option<RewindData>, ChainError> {
        Ok(RewindTable::get(self.kv.as_ref(), DbInt(height))?.map(|DbSerde(data)| data))
    }
}

impl CoinView for DurableCoinView {
    fn fetch(&self, txids: &[Hash<32>]) -> Result<FetchedCoins, ChainError> {
        let mut found = FetchedCoins::with_capacity(txids.len());

        for txid in txids {
            let entry =
                UtxoTable::get(self.kv.as_ref(), DbHash(**txid))?.map(|DbSerde(entry)| entry);
            found.insert(*txid, entry);
        }

        Ok(found)
    }

    #[instrument(skip_all, fields(%block_hash))]
    fn apply(
        &self,
        block_hash: Hash<32>,
        prev_hash: Hash<32>,
        changes: CoinViewChanges,
    ) -> Result<(), ChainError> {
        let _guard = self.write_lock.lock().expect("lock is never poisoned");

        let tip = self.read_tip()?;
        if tip.hash != prev_hash {
            return Err(ChainError::invariant(format!(
                "apply of {block_hash} expects tip {prev_hash} but coinview is at {}",
                tip.hash
            )));
        }

        let mut batch = WriteBatch::new();
        let mut rewind = RewindData {
            prev_block_hash: tip.hash,
            to_remove: Vec::with_capacity(changes.created.len()),
            to_restore: Vec::new(),
        };

        // spends: snapshot each touched entry once, then thread the
        // mutations through a local map so double-spends within the
        // same block surface as missing outputs
        let mut touched: std::collections::HashMap<Hash<32>, UnspentOutputs> =
            std::collections::HashMap::new();

        for (txid, vout) in &changes.spends {
            if !touched.contains_key(txid) {
                let entry = UtxoTable::get(self.kv.as_ref(), DbHash(**txid))?
                    .map(|DbSerde(entry)| entry)
                    .ok_or(crate::ConsensusError::MissingInput)?;

                rewind.to_restore.push((*txid, entry.clone()));
                touched.insert(*txid, entry);
            }

            let entry = touched.get_mut(txid).expect("inserted above");
            if entry.spend(*vout).is_none() {
                return Err(crate::ConsensusError::MissingInput.into());
            }
        }

        for (txid, entry) in touched {
            if entry.is_fully_spent() {
                UtxoTable::stage_delete(&mut batch, DbHash(*txid));
            } else {
                UtxoTable::stage_put(&mut batch, DbHash(*txid), DbSerde(entry))?;
            }
        }

        for (txid, entry) in changes.created {
            rewind.to_remove.push(txid);
            UtxoTable::stage_put(&mut batch, DbHash(*txid), DbSerde(entry))?;
        }

        let new_tip = CoinViewTip {
            hash: block_hash,
            height: tip.height + 1,
        };

        RewindTable::stage_put(&mut batch, DbInt(new_tip.height), DbSerde(rewind))?;
        TipTable::stage_put(&mut batch, DbInt(TIP_KEY), DbSerde(new_tip))?;

        // drop rewind records behind the retention window
        if new_tip.height > REWIND_WINDOW {
            RewindTable::stage_delete(&mut batch, DbInt(new_tip.height - REWIND_WINDOW));
        }

        trace!(ops = batch.len(), height = new_tip.height, "committing apply");
        self.kv.commit(batch)?;

        Ok(())
    }

    fn rewind(&self) -> Result<Hash<32>, ChainError> {
        let _guard = self.write_lock.lock().expect("lock is never poisoned");

        let tip = self.read_tip()?;
        let rewind = self.read_rewind(tip.height)?.ok_or_else(|| {
            ChainError::invariant(format!(
                "no rewind data for coinview tip {} at height {}",
                tip.hash, tip.height
            ))
        })?;

        let mut batch = WriteBatch::new();

        for txid in &rewind.to_remove {
            UtxoTable::stage_delete(&mut batch, DbHash(**txid));
        }

        for (txid, entry) in &rewind.to_restore {
            UtxoTable::stage_put(&mut batch, DbHash(**txid), DbSerde(entry.clone()))?;
        }

        let new_tip = CoinViewTip {
            hash: rewind.prev_block_hash,
            height: tip.height - 1,
        };

        RewindTable::stage_delete(&mut batch, DbInt(tip.height));
        TipTable::stage_put(&mut batch, DbInt(TIP_KEY), DbSerde(new_tip))?;

        debug!(from = %tip.hash, to = %new_tip.hash, "rewound coinview");
        self.kv.commit(batch)?;

        Ok(new_tip.hash)
    }

    fn tip(&self) -> Result<CoinViewTip, ChainError> {
        self.read_tip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinview::testutil::*;
    use std::sync::Arc;
    use xds_storage::MemoryKv;

    fn fresh() -> DurableCoinView {
        let kv: SharedKv = Arc::new(MemoryKv::new(COINVIEW_TABLES));
        DurableCoinView::open(kv, block_hash(0)).unwrap()
    }

    #[test]
    fn apply_advances_tip_and_stores_entries() {
        let view = fresh();
        let (txid, entry) = entry(1, 2);

        view.apply(
            block_hash(1),
            block_hash(0),
            CoinViewChanges {
                spends: vec![],
                created: vec![(txid, entry.clone())],
            },
        )
        .unwrap();

        let tip = view.tip().unwrap();
        assert_eq!(tip.hash, block_hash(1));
        assert_eq!(tip.height, 1);

        let fetched = view.fetch(&[txid]).unwrap();
        assert_eq!(fetched[&txid], Some(entry));
    }

    #[test]
    fn apply_on_wrong_tip_is_invariant_violation() {
        let view = fresh();

        let result = view.apply(block_hash(2), block_hash(9), CoinViewChanges::default());
        assert!(matches!(result, Err(ChainError::Invariant(_))));
    }

    #[test]
    fn spend_of_missing_output_fails() {
        let view = fresh();

        let result = view.apply(
            block_hash(1),
            block_hash(0),
            CoinViewChanges {
                spends: vec![(block_hash(77), 0)],
                created: vec![],
            },
        );

        assert!(matches!(
            result,
            Err(ChainError::Consensus(crate::ConsensusError::MissingInput))
        ));
    }

    #[test]
    fn rewind_is_exact_inverse_of_apply() {
        let view = fresh();
        let (txid_a, entry_a) = entry(1, 2);
        let (txid_b, entry_b) = entry(2, 1);

        view.apply(
            block_hash(1),
            block_hash(0),
            CoinViewChanges {
                spends: vec![],
                created: vec![(txid_a, entry_a.clone())],
            },
        )
        .unwrap();

        // block 2 spends one output of a and creates b
        view.apply(
            block_hash(2),
            block_hash(1),
            CoinViewChanges {
                spends: vec![(txid_a, 0)],
                created: vec![(txid_b, entry_b)],
            },
        )
        .unwrap();

        assert_eq!(view.rewind().unwrap(), block_hash(1));

        let fetched = view.fetch(&[txid_a, txid_b]).unwrap();
        assert_eq!(fetched[&txid_a], Some(entry_a));
        assert_eq!(fetched[&txid_b], None);
        assert_eq!(view.tip().unwrap().height, 1);

        assert_eq!(view.rewind().unwrap(), block_hash(0));
        let fetched = view.fetch(&[txid_a]).unwrap();
        assert_eq!(fetched[&txid_a], None);
    }

    #[test]
    fn fully_spent_entry_is_pruned_and_restored() {
        let view = fresh();
        let (txid, entry_val) = entry(1, 1);

        view.apply(
            block_hash(1),
            block_hash(0),
            CoinViewChanges {
                spends: vec![],
                created: vec![(txid, entry_val.clone())],
            },
        )
        .unwrap();

        view.apply(
            block_hash(2),
            block_hash(1),
            CoinViewChanges {
                spends: vec![(txid, 0)],
                created: vec![],
            },
        )
        .unwrap();

        assert_eq!(view.fetch(&[txid]).unwrap()[&txid], None);

        view.rewind().unwrap();
        assert_eq!(view.fetch(&[txid]).unwrap()[&txid], Some(entry_val));
    }

    #[test]
    fn rewind_without_history_is_fatal() {
        let view = fresh();
        assert!(matches!(view.rewind(), Err(ChainError::Invariant(_))));
    }
}
