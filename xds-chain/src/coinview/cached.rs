//! In-memory working set above the durable coinview.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};
use xds_crypto::Hash;

use crate::error::ChainError;

use super::{CoinView, CoinViewChanges, CoinViewTip, FetchedCoins, UnspentOutputs};

/// Applies buffered before reaching the durable layer.
const FLUSH_INTERVAL: usize = 50;

/// Entries kept in memory before clean ones are evicted.
const CACHE_CAPACITY: usize = 100_000;

struct PendingBlock {
    block_hash: Hash<32>,
    prev_hash: Hash<32>,
    changes: CoinViewChanges,
    /// Pre-apply snapshots of entries the block touched, for cheap
    /// in-memory rewind.
    snapshots: Vec<(Hash<32>, Option<UnspentOutputs>)>,
}

struct CacheState {
    /// Known entry states; `None` caches an absent txid.
    entries: HashMap<Hash<32>, Option<UnspentOutputs>>,
    /// Applies not yet pushed to the durable layer, oldest first.
    pending: VecDeque<PendingBlock>,
    /// Txids touched by pending blocks; never evicted.
    dirty: HashSet<Hash<32>>,
    tip: CoinViewTip,
}

/// Write-back cache over a durable coinview.
///
/// Applies mutate only the in-memory state and are pushed down in
/// batches; `flush` drains everything, and only after it returns is
/// the buffered work durable. Rewinds pop pending applies first and
/// touch the durable layer only when the buffer is empty.
pub struct CachedCoinView {
    inner: Arc<dyn CoinView>,
    state: Mutex<CacheState>,
}

impl CachedCoinView {
    pub fn new(inner: Arc<dyn CoinView>) -> Result<Self, ChainError> {
        let tip = inner.tip()?;

        Ok(Self {
            inner,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                pending: VecDeque::new(),
                dirty: HashSet::new(),
                tip,
            }),
        })
    }

    /// Push every buffered apply to the durable layer.
    pub fn flush(&self) -> Result<(), ChainError> {
        let mut state = self.state.lock().expect("lock is never poisoned");
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut CacheState) -> Result<(), ChainError> {
        while let Some(block) = state.pending.pop_front() {
            trace!(block = %block.block_hash, "flushing buffered apply");
            self.inner
                .apply(block.block_hash, block.prev_hash, block.changes)?;
        }

        state.dirty.clear();
        self.evict_if_needed(state);

        Ok(())
    }

    fn evict_if_needed(&self, state: &mut CacheState) {
        if state.entries.len() <= CACHE_CAPACITY {
            return;
        }

        let before = state.entries.len();
        let dirty = std::mem::take(&mut state.dirty);
        state.entries.retain(|txid, _| dirty.contains(txid));
        state.dirty = dirty;

        debug!(evicted = before - state.entries.len(), "evicted clean coinview entries");
    }

    /// Buffered applies not yet durable; exposed for the periodic log.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .expect("lock is never poisoned")
            .pending
            .len()
    }
}

impl CoinView for CachedCoinView {
    fn fetch(&self, txids: &[Hash<32>]) -> Result<FetchedCoins, ChainError> {
        let mut state = self.state.lock().expect("lock is never poisoned");
        let mut found = FetchedCoins::with_capacity(txids.len());
        let mut misses = Vec::new();

        for txid in txids {
            match state.entries.get(txid) {
                Some(entry) => {
                    found.insert(*txid, entry.clone());
                }
                None => misses.push(*txid),
            }
        }

        if !misses.is_empty() {
            let fetched = self.inner.fetch(&misses)?;

            for (txid, entry) in fetched {
                state.entries.insert(txid, entry.clone());
                found.insert(txid, entry);
            }
        }

        Ok(found)
    }

    fn apply(
        &self,
        block_hash: Hash<32>,
        prev_hash: Hash<32>,
        changes: CoinViewChanges,
    ) -> Result<(), ChainError> {
        let mut state = self.state.lock().expect("lock is never poisoned");

        if state.tip.hash != prev_hash {
            return Err(ChainError::invariant(format!(
                "apply of {block_hash} expects tip {prev_hash} but cache is at {}",
                state.tip.hash
            )));
        }

        // ensure every spent txid is resident so mutation and
        // snapshotting work on known values
        let spend_txids: Vec<Hash<32>> = changes
            .spends
            .iter()
            .map(|(txid, _)| *txid)
            .filter(|txid| !state.entries.contains_key(txid))
            .collect();

        if !spend_txids.is_empty() {
            let fetched = self.inner.fetch(&spend_txids)?;
            state.entries.extend(fetched);
        }

        let mut snapshots = Vec::new();
        let mut snapshotted = HashSet::new();

        for (txid, vout) in &changes.spends {
            if snapshotted.insert(*txid) {
                let current = state.entries.get(txid).cloned().flatten();
                snapshots.push((*txid, current));
            }

            let entry = state
                .entries
                .get_mut(txid)
                .and_then(Option::as_mut)
                .ok_or(crate::ConsensusError::MissingInput)?;

            if entry.spend(*vout).is_none() {
                return Err(crate::ConsensusError::MissingInput.into());
            }

            if entry.is_fully_spent() {
                state.entries.insert(*txid, None);
            }

            state.dirty.insert(*txid);
        }

        for (txid, entry) in &changes.created {
            if snapshotted.insert(*txid) {
                snapshots.push((*txid, None));
            }
            state.entries.insert(*txid, Some(entry.clone()));
            state.dirty.insert(*txid);
        }

        state.tip = CoinViewTip {
            hash: block_hash,
            height: state.tip.height + 1,
        };

        state.pending.push_back(PendingBlock {
            block_hash,
            prev_hash,
            changes,
            snapshots,
        });

        if state.pending.len() >= FLUSH_INTERVAL {
            self.flush_locked(&mut state)?;
        }

        Ok(())
    }

    fn rewind(&self) -> Result<Hash<32>, ChainError> {
        let mut state = self.state.lock().expect("lock is never poisoned");

        if let Some(block) = state.pending.pop_back() {
            for (txid, snapshot) in block.snapshots.into_iter().rev() {
                state.entries.insert(txid, snapshot);
            }

            state.tip = CoinViewTip {
                hash: block.prev_hash,
                height: state.tip.height - 1,
            };

            return Ok(block.prev_hash);
        }

        // nothing buffered: rewind durably and drop the cache, which
        // may now hold stale entries
        let new_tip = self.inner.rewind()?;
        state.entries.clear();
        state.dirty.clear();
        state.tip = self.inner.tip()?;

        debug_assert_eq!(state.tip.hash, new_tip);

        Ok(new_tip)
    }

    fn tip(&self) -> Result<CoinViewTip, ChainError> {
        Ok(self.state.lock().expect("lock is never poisoned").tip)
    }
}
