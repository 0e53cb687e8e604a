//! Pool state and the acceptance pipeline.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use xds_addresses::ScriptClass;
use xds_chain::coinview::CoinView;
use xds_chain::{script, ChainEvent, ConsensusError};
use xds_crypto::Hash;
use xds_primitives::{money_range, Amount, NetworkParams, OutPoint, Transaction, TxOutput};
use xds_runtime::EventBus;

use crate::MempoolError;

/// Standardness ceiling on one transaction's virtual size.
const MAX_STANDARD_TX_VSIZE: usize = 100_000;

/// Sigop allowance for one transaction.
const MAX_TX_SIGOPS: usize = 4_000;

/// Aggregate size and fee of a transaction package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackageStats {
    pub count: usize,
    pub vsize: usize,
    pub fees: Amount,
}

impl PackageStats {
    fn add(&mut self, vsize: usize, fee: Amount) {
        self.count += 1;
        self.vsize += vsize;
        self.fees += fee;
    }

    fn sub(&mut self, vsize: usize, fee: Amount) {
        self.count = self.count.saturating_sub(1);
        self.vsize = self.vsize.saturating_sub(vsize);
        self.fees -= fee;
    }
}

/// One admitted transaction with its package bookkeeping.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Arc<Transaction>,
    pub txid: Hash<32>,
    pub fee: Amount,
    pub vsize: usize,
    /// Unix seconds at admission.
    pub time: u64,
    /// Chain height at admission.
    pub height: u64,
    /// This entry plus all in-pool ancestors.
    pub ancestors: PackageStats,
    /// This entry plus all in-pool descendants.
    pub descendants: PackageStats,
}

impl MempoolEntry {
    /// Satoshi per kilo-vbyte, the ordering key.
    pub fn fee_rate(&self) -> u64 {
        if self.vsize == 0 {
            return 0;
        }
        (self.fee as u64).saturating_mul(1000) / self.vsize as u64
    }
}

#[derive(Debug, Clone)]
pub struct MempoolConfig {
    pub max_ancestors: usize,
    pub max_ancestor_vsize: usize,
    pub max_descendants: usize,
    pub max_descendant_vsize: usize,
    /// Entries older than this are expired.
    pub expiry_secs: u64,
    /// Admitted vbytes allowed per rate window.
    pub rate_limit_vsize: usize,
    pub rate_window_secs: u64,
    /// Full script validation on admission. Kept configurable the way
    /// the block-import path is, for replay and benchmarks.
    pub require_valid_scripts: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_ancestors: 25,
            max_ancestor_vsize: 101_000,
            max_descendants: 25,
            max_descendant_vsize: 101_000,
            expiry_secs: 336 * 60 * 60,
            rate_limit_vsize: 500_000,
            rate_window_secs: 600,
            require_valid_scripts: true,
        }
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<Hash<32>, MempoolEntry>,
    /// Outpoint -> spending txid, for conflict lookup.
    by_outpoint: HashMap<OutPoint, Hash<32>>,
    /// Fee-rate ordered view: (sat/kvB, txid), ascending.
    by_fee_rate: BTreeSet<(u64, Hash<32>)>,
    /// In-pool parent/child adjacency.
    parents: HashMap<Hash<32>, HashSet<Hash<32>>>,
    children: HashMap<Hash<32>, HashSet<Hash<32>>>,
    /// Rate limiting window.
    window_start: u64,
    window_used_vsize: usize,
}

/// Serialized pool snapshot written at shutdown.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    transactions: Vec<(Transaction, u64)>,
}

/// The node's pending transaction pool.
pub struct Mempool {
    params: NetworkParams,
    config: MempoolConfig,
    state: RwLock<PoolState>,
    events: Option<Arc<EventBus<ChainEvent>>>,
}

impl Mempool {
    pub fn new(params: NetworkParams, config: MempoolConfig) -> Self {
        Self {
            params,
            config,
            state: RwLock::new(PoolState::default()),
            events: None,
        }
    }

    /// Attach the node event bus; each admission publishes exactly
    /// one `TransactionReceived`.
    pub fn with_events(mut self, events: Arc<EventBus<ChainEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run the acceptance pipeline for one transaction.
    pub fn accept(
        &self,
        tx: Transaction,
        view: &dyn CoinView,
        tip_height: u64,
        now: u64,
    ) -> Result<(), MempoolError> {
        let txid = tx.txid();
        let mut state = self.state.write().expect("lock is never poisoned");

        // pre-checks: shape and standardness
        if state.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyInPool);
        }
        self.pre_checks(&tx)?;

        // conflicts against the pool
        let conflicts: HashSet<Hash<32>> = tx
            .inputs
            .iter()
            .filter_map(|input| state.by_outpoint.get(&input.prevout).copied())
            .collect();

        // resolve inputs against pool parents and the coinview
        let (resolved, parent_ids) =
            self.resolve_inputs(&state, &tx, view, tip_height, &conflicts)?;

        // create the candidate entry
        let total_in: Amount = resolved.iter().map(|o| o.value).sum();
        let total_out = tx.total_output_value();
        if total_out > total_in {
            return Err(ConsensusError::BadAmount.into());
        }
        let fee = total_in - total_out;
        let vsize = tx.vsize();

        // policy rules, in pipeline order
        self.policy_checks(&tx)?;

        if fee < self.params.min_tx_fee {
            return Err(ConsensusError::FeeBelowAbsoluteMinTxFee.into());
        }

        self.check_rate_limit(&mut state, vsize, now)?;

        let ancestors =
            self.check_package_limits(&state, &parent_ids, vsize, fee)?;

        if !conflicts.is_empty() {
            self.check_replacement(&state, &tx, fee, vsize, &conflicts, &parent_ids)?;
        }

        if self.config.require_valid_scripts {
            for (index, spent) in resolved.iter().enumerate() {
                script::verify_input(&tx, index, spent)
                    .map_err(MempoolError::Consensus)?;
            }
        }

        // all checks passed: evict the replaced set, then insert
        for conflict in conflicts {
            self.remove_with_descendants(&mut state, &conflict, "replaced");
        }

        let entry = MempoolEntry {
            tx: Arc::new(tx),
            txid,
            fee,
            vsize,
            time: now,
            height: tip_height,
            ancestors,
            descendants: PackageStats {
                count: 1,
                vsize,
                fees: fee,
            },
        };

        self.insert(&mut state, entry, parent_ids);
        state.window_used_vsize += vsize;

        let admitted = state.entries[&txid].tx.clone();
        drop(state);

        // one event per admission, published outside the pool lock
        if let Some(events) = &self.events {
            events.publish(ChainEvent::TransactionReceived(admitted));
        }

        debug!(%txid, fee, vsize, "transaction admitted");
        Ok(())
    }

    fn pre_checks(&self, tx: &Transaction) -> Result<(), MempoolError> {
        if tx.is_coinbase() || tx.is_coinstake() {
            return Err(MempoolError::NonStandard("reward transaction"));
        }

        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(ConsensusError::BadTransaction.into());
        }

        if tx.version < 1 {
            return Err(MempoolError::NonStandard("version"));
        }

        if tx.vsize() > MAX_STANDARD_TX_VSIZE {
            return Err(MempoolError::NonStandard("oversized"));
        }

        let mut seen = HashSet::new();
        let mut total: Amount = 0;

        for input in &tx.inputs {
            if input.prevout.is_null() {
                return Err(ConsensusError::BadTransaction.into());
            }
            if !seen.insert(input.prevout) {
                return Err(ConsensusError::DuplicateInput.into());
            }
        }

        for output in &tx.outputs {
            if !money_range(output.value) {
                return Err(ConsensusError::BadAmount.into());
            }
            total = total
                .checked_add(output.value)
                .ok_or(ConsensusError::BadAmount)?;
        }

        if !money_range(total) {
            return Err(ConsensusError::BadAmount.into());
        }

        Ok(())
    }

    /// Input checks from the later pipeline stages that need no
    /// coinview: witness presence, scriptSig emptiness, whitelist,
    /// sigops.
    fn policy_checks(&self, tx: &Transaction) -> Result<(), MempoolError> {
        if tx.inputs.iter().any(|input| input.witness.is_empty()) {
            return Err(ConsensusError::MissingWitness.into());
        }

        if tx.inputs.iter().any(|input| !input.script_sig.is_empty()) {
            return Err(ConsensusError::ScriptSigNotEmpty.into());
        }

        for output in &tx.outputs {
            if !ScriptClass::of(&output.script_pubkey).is_whitelisted() {
                return Err(ConsensusError::OutputNotWhitelisted.into());
            }
        }

        let sigops = tx.inputs.len()
            + tx.outputs
                .iter()
                .map(|o| {
                    o.script_pubkey
                        .iter()
                        .filter(|b| **b == 0xac || **b == 0xae)
                        .count()
                })
                .sum::<usize>();

        if sigops > MAX_TX_SIGOPS {
            return Err(ConsensusError::BadSigOpCount.into());
        }

        Ok(())
    }

    fn resolve_inputs(
        &self,
        state: &PoolState,
        tx: &Transaction,
        view: &dyn CoinView,
        tip_height: u64,
        conflicts: &HashSet<Hash<32>>,
    ) -> Result<(Vec<TxOutput>, HashSet<Hash<32>>), MempoolError> {
        let mut resolved = Vec::with_capacity(tx.inputs.len());
        let mut parent_ids = HashSet::new();

        let chain_lookups: Vec<Hash<32>> = tx
            .inputs
            .iter()
            .filter(|input| !state.entries.contains_key(&input.prevout.txid))
            .map(|input| input.prevout.txid)
            .collect();
        let fetched = view.fetch(&chain_lookups)?;

        for input in &tx.inputs {
            if let Some(parent) = state.entries.get(&input.prevout.txid) {
                // spending an unconfirmed output
                if conflicts.contains(&parent.txid) {
                    // spends an output of a transaction it also
                    // conflicts with; unresolvable
                    return Err(ConsensusError::MissingInput.into());
                }

                let output = parent
                    .tx
                    .outputs
                    .get(input.prevout.vout as usize)
                    .ok_or(ConsensusError::MissingInput)?;

                resolved.push(output.clone());
                parent_ids.insert(parent.txid);
                continue;
            }

            let entry = fetched
                .get(&input.prevout.txid)
                .cloned()
                .flatten()
                .ok_or(ConsensusError::MissingInput)?;

            let output = entry
                .output(input.prevout.vout)
                .cloned()
                .ok_or(ConsensusError::MissingInput)?;

            if entry.requires_maturity()
                && !self.params.is_mature(entry.height, tip_height + 1)
            {
                return Err(ConsensusError::ImmatureSpend.into());
            }

            resolved.push(output);
        }

        Ok((resolved, parent_ids))
    }

    fn check_rate_limit(
        &self,
        state: &mut PoolState,
        vsize: usize,
        now: u64,
    ) -> Result<(), MempoolError> {
        if now.saturating_sub(state.window_start) >= self.config.rate_window_secs {
            state.window_start = now;
            state.window_used_vsize = 0;
        }

        if state.window_used_vsize + vsize > self.config.rate_limit_vsize {
            return Err(MempoolError::RateLimited);
        }

        Ok(())
    }

    /// Ancestor closure of the candidate plus limit checks both ways.
    fn check_package_limits(
        &self,
        state: &PoolState,
        parent_ids: &HashSet<Hash<32>>,
        vsize: usize,
        fee: Amount,
    ) -> Result<PackageStats, MempoolError> {
        let ancestor_ids = self.closure(state, parent_ids.iter().copied(), |s, id| {
            s.parents.get(id)
        });

        let mut stats = PackageStats {
            count: 1,
            vsize,
            fees: fee,
        };

        for id in &ancestor_ids {
            let entry = &state.entries[id];
            stats.add(entry.vsize, entry.fee);
        }

        if stats.count > self.config.max_ancestors
            || stats.vsize > self.config.max_ancestor_vsize
        {
            return Err(MempoolError::AncestorLimit {
                count: stats.count,
                vsize: stats.vsize,
            });
        }

        // admitting the candidate grows every ancestor's descendant
        // package; none may overflow
        for id in &ancestor_ids {
            let entry = &state.entries[id];
            let count = entry.descendants.count + 1;
            let total = entry.descendants.vsize + vsize;

            if count > self.config.max_descendants
                || total > self.config.max_descendant_vsize
            {
                return Err(MempoolError::DescendantLimit {
                    count,
                    vsize: total,
                });
            }
        }

        Ok(stats)
    }

    /// Replacement policy: the newcomer must beat what it evicts on
    /// both absolute fee and fee rate, without introducing new
    /// unconfirmed parents.
    fn check_replacement(
        &self,
        state: &PoolState,
        _tx: &Transaction,
        fee: Amount,
        vsize: usize,
        conflicts: &HashSet<Hash<32>>,
        parent_ids: &HashSet<Hash<32>>,
    ) -> Result<(), MempoolError> {
        let evicted = self.closure(state, conflicts.iter().copied(), |s, id| {
            s.children.get(id)
        });

        let evicted_fees: Amount = evicted.iter().map(|id| state.entries[id].fee).sum();

        if fee <= evicted_fees {
            return Err(MempoolError::RbfNotAllowed);
        }

        let new_rate = (fee as u64).saturating_mul(1000) / vsize.max(1) as u64;
        let beats_every_conflict = conflicts
            .iter()
            .all(|id| new_rate > state.entries[id].fee_rate());

        if !beats_every_conflict {
            return Err(MempoolError::RbfNotAllowed);
        }

        let allowed_parents: HashSet<Hash<32>> = conflicts
            .iter()
            .flat_map(|id| state.parents.get(id).into_iter().flatten().copied())
            .collect();

        if !parent_ids.is_subset(&allowed_parents) {
            return Err(MempoolError::RbfNotAllowed);
        }

        Ok(())
    }

    /// Transitive closure over the pool graph, starting set included.
    fn closure<'a>(
        &self,
        state: &'a PoolState,
        start: impl Iterator<Item = Hash<32>>,
        edges: impl Fn(&'a PoolState, &Hash<32>) -> Option<&'a HashSet<Hash<32>>>,
    ) -> HashSet<Hash<32>> {
        let mut seen: HashSet<Hash<32>> = start.collect();
        let mut queue: VecDeque<Hash<32>> = seen.iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if let Some(next) = edges(state, &id) {
                for neighbor in next {
                    if seen.insert(*neighbor) {
                        queue.push_back(*neighbor);
                    }
                }
            }
        }

        seen
    }

    fn insert(&self, state: &mut PoolState, entry: MempoolEntry, parent_ids: HashSet<Hash<32>>) {
        let txid = entry.txid;
        let vsize = entry.vsize;
        let fee = entry.fee;

        for input in &entry.tx.inputs {
            state.by_outpoint.insert(input.prevout, txid);
        }

        state.by_fee_rate.insert((entry.fee_rate(), txid));

        // grow descendant packages up the ancestor closure
        let ancestor_ids = self.closure(state, parent_ids.iter().copied(), |s, id| {
            s.parents.get(id)
        });
        for id in &ancestor_ids {
            if let Some(ancestor) = state.entries.get_mut(id) {
                ancestor.descendants.add(vsize, fee);
            }
        }

        for parent in &parent_ids {
            state.children.entry(*parent).or_default().insert(txid);
        }
        state.parents.insert(txid, parent_ids);
        state.entries.insert(txid, entry);
    }

    /// Remove an entry and everything that depends on it.
    fn remove_with_descendants(
        &self,
        state: &mut PoolState,
        txid: &Hash<32>,
        reason: &'static str,
    ) {
        let doomed = self.closure(state, std::iter::once(*txid), |s, id| s.children.get(id));

        for id in &doomed {
            self.remove_single(state, id, reason);
        }
    }

    /// Remove one entry, fixing indexes and package stats. Descendant
    /// links survive only for entries not being removed themselves.
    fn remove_single(&self, state: &mut PoolState, txid: &Hash<32>, reason: &'static str) {
        let Some(entry) = state.entries.remove(txid) else {
            return;
        };

        trace!(%txid, reason, "removing mempool entry");

        for input in &entry.tx.inputs {
            if state.by_outpoint.get(&input.prevout) == Some(txid) {
                state.by_outpoint.remove(&input.prevout);
            }
        }

        state.by_fee_rate.remove(&(entry.fee_rate(), *txid));

        // shrink ancestor packages
        let parent_ids = state.parents.remove(txid).unwrap_or_default();
        let ancestor_ids = self.closure(state, parent_ids.iter().copied(), |s, id| {
            s.parents.get(id)
        });
        for id in &ancestor_ids {
            if let Some(ancestor) = state.entries.get_mut(id) {
                ancestor.descendants.sub(entry.vsize, entry.fee);
            }
        }
        for parent in &parent_ids {
            if let Some(children) = state.children.get_mut(parent) {
                children.remove(txid);
            }
        }

        // shrink descendant ancestor-packages
        let descendant_ids =
            self.closure(state, std::iter::once(*txid), |s, id| s.children.get(id));
        for id in descendant_ids {
            if id == *txid {
                continue;
            }
            if let Some(descendant) = state.entries.get_mut(&id) {
                descendant.ancestors.sub(entry.vsize, entry.fee);
            }
        }

        if let Some(children) = state.children.remove(txid) {
            for child in children {
                if let Some(child_parents) = state.parents.get_mut(&child) {
                    child_parents.remove(txid);
                }
            }
        }
    }

    /// A block was connected: confirmed transactions leave the pool
    /// and anything now conflicting is evicted with its descendants.
    pub fn on_block_connected(&self, block: &xds_primitives::Block) {
        let mut state = self.state.write().expect("lock is never poisoned");

        for tx in &block.transactions {
            let txid = tx.txid();

            // a confirmed transaction leaves alone; its descendants
            // remain valid
            self.remove_single(&mut state, &txid, "confirmed");

            for input in &tx.inputs {
                if input.prevout.is_null() {
                    continue;
                }

                if let Some(spender) = state.by_outpoint.get(&input.prevout).copied() {
                    self.remove_with_descendants(&mut state, &spender, "conflicts with block");
                }
            }
        }
    }

    /// A block was disconnected: its transactions re-enter through
    /// the full acceptance pipeline; whatever no longer validates is
    /// dropped.
    pub fn on_block_disconnected(
        &self,
        block: &xds_primitives::Block,
        view: &dyn CoinView,
        tip_height: u64,
        now: u64,
    ) {
        for tx in &block.transactions {
            if tx.is_coinbase() || tx.is_coinstake() {
                continue;
            }

            if let Err(err) = self.accept(tx.clone(), view, tip_height, now) {
                debug!(txid = %tx.txid(), kind = err.kind(), "disconnected tx not re-admitted");
            }
        }
    }

    /// Drop entries older than the configured expiry.
    pub fn expire(&self, now: u64) -> usize {
        let mut state = self.state.write().expect("lock is never poisoned");

        let expired: Vec<Hash<32>> = state
            .entries
            .values()
            .filter(|entry| now.saturating_sub(entry.time) >= self.config.expiry_secs)
            .map(|entry| entry.txid)
            .collect();

        let count = expired.len();
        for txid in expired {
            self.remove_with_descendants(&mut state, &txid, "expired");
        }

        if count > 0 {
            debug!(count, "expired mempool entries");
        }

        count
    }

    pub fn contains(&self, txid: &Hash<32>) -> bool {
        self.state
            .read()
            .expect("lock is never poisoned")
            .entries
            .contains_key(txid)
    }

    pub fn get(&self, txid: &Hash<32>) -> Option<MempoolEntry> {
        self.state
            .read()
            .expect("lock is never poisoned")
            .entries
            .get(txid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .expect("lock is never poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Txids ordered by fee rate, best first.
    pub fn sorted_by_fee_rate(&self) -> Vec<Hash<32>> {
        self.state
            .read()
            .expect("lock is never poisoned")
            .by_fee_rate
            .iter()
            .rev()
            .map(|(_, txid)| *txid)
            .collect()
    }

    /// Serialize the pool for shutdown persistence. Entries are
    /// ordered parents-first so the replay resolves in-pool chains.
    pub fn snapshot(&self) -> Vec<u8> {
        let state = self.state.read().expect("lock is never poisoned");

        let mut entries: Vec<&MempoolEntry> = state.entries.values().collect();
        entries.sort_by_key(|entry| (entry.ancestors.count, entry.time));

        let snapshot = Snapshot {
            transactions: entries
                .into_iter()
                .map(|entry| ((*entry.tx).clone(), entry.time))
                .collect(),
        };

        bincode::serialize(&snapshot).unwrap_or_default()
    }

    /// Replay a snapshot through the acceptance pipeline; entries
    /// that no longer validate are dropped.
    pub fn restore(
        &self,
        bytes: &[u8],
        view: &dyn CoinView,
        tip_height: u64,
    ) -> usize {
        let Ok(snapshot) = bincode::deserialize::<Snapshot>(bytes) else {
            warn!("mempool snapshot is unreadable, starting empty");
            return 0;
        };

        let mut restored = 0;
        for (tx, time) in snapshot.transactions {
            if self.accept(tx, view, tip_height, time).is_ok() {
                restored += 1;
            }
        }

        restored
    }
}
