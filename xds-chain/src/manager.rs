//! The consensus manager: drives blocks from arrival to integration.
//!
//! Headers connect on the caller's thread; integrity checks run on
//! block arrival; partial validation is scheduled off the hot path;
//! full validation, reorgs and every coinview mutation happen under
//! the single chain-writer lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use tracing::{debug, info, warn};
use xds_crypto::Hash;
use xds_primitives::{Block, BlockHeader, NetworkParams, ProvenHeader};
use xds_runtime::EventBus;

use crate::coinview::CoinView;
use crate::error::{ChainError, ConsensusError};
use crate::events::{ChainEvent, ChainedBlock};
use crate::indexer::{ChainIndexer, ChainedHeader, ValidationState};
use crate::invalid::InvalidBlockHashStore;
use crate::puller::{BlockPuller, DownloadOrders};
use crate::rules::{
    full::run_full_validation, HeaderContext, IntegrityContext, PartialContext, RuleEngine,
};
use crate::stake::{BlockStake, StakeChain};
use crate::store::BlockStore;
use crate::PeerId;

/// Height lag behind the best peer that still counts as IBD.
const IBD_HEIGHT_LAG: u64 = 10;

/// Tip age in seconds beyond which the node reports IBD.
const IBD_TIP_AGE_SECS: u64 = 60 * 60;

/// Ban handed to peers that feed us invalid headers or blocks.
pub const DEFAULT_BAN_SECS: u64 = 8000;

/// Result of processing a batch of headers.
pub struct HeadersOutcome {
    pub connected: usize,
    /// Body downloads to dispatch, grouped by peer.
    pub download: DownloadOrders,
}

/// Result of trying to advance the active chain.
#[derive(Debug)]
pub enum ActivationOutcome {
    /// The chain tip moved to this header.
    Activated(Arc<ChainedHeader>),
    /// The candidate does not beat the current tip; kept for later.
    Held,
    /// Bodies are missing; download orders were produced.
    NeedBodies(DownloadOrders),
    /// The candidate branch was refused and marked invalid.
    Rejected(ConsensusError),
}

type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

fn system_clock() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct ConsensusManager {
    params: NetworkParams,
    rules: RuleEngine,
    indexer: ChainIndexer,
    coinview: Arc<dyn CoinView>,
    stake_chain: StakeChain,
    block_store: BlockStore,
    puller: BlockPuller,
    invalid: InvalidBlockHashStore,
    events: Arc<EventBus<ChainEvent>>,
    /// The chain-writer lock: serializes full validation, coinview
    /// mutation and tip movement.
    writer: Mutex<()>,
    best_peer_height: AtomicU64,
    clock: Clock,
}

impl ConsensusManager {
    pub fn new(
        params: NetworkParams,
        rules: RuleEngine,
        coinview: Arc<dyn CoinView>,
        stake_chain: StakeChain,
        block_store: BlockStore,
        events: Arc<EventBus<ChainEvent>>,
    ) -> Self {
        let indexer = ChainIndexer::new(&params);

        Self {
            params,
            rules,
            indexer,
            coinview,
            stake_chain,
            block_store,
            puller: BlockPuller::new(),
            invalid: InvalidBlockHashStore::new(),
            events,
            writer: Mutex::new(()),
            best_peer_height: AtomicU64::new(0),
            clock: Box::new(system_clock),
        }
    }

    /// Replace the wall clock; tests pin it.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn indexer(&self) -> &ChainIndexer {
        &self.indexer
    }

    pub fn puller(&self) -> &BlockPuller {
        &self.puller
    }

    pub fn events(&self) -> &Arc<EventBus<ChainEvent>> {
        &self.events
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn tip(&self) -> Arc<ChainedHeader> {
        self.indexer.tip()
    }

    /// Serve a stored block body, e.g. for `getdata`.
    pub fn get_block_query(&self, hash: &Hash<32>) -> Result<Option<Block>, ChainError> {
        self.block_store.get_block(hash)
    }

    /// Current coinview tip; equals the chain tip between writer
    /// actions.
    pub fn coinview_tip(&self) -> Result<crate::coinview::CoinViewTip, ChainError> {
        self.coinview.tip()
    }

    /// Record a peer's advertised height for IBD and scheduling.
    pub fn report_peer_height(&self, peer: PeerId, height: u64) {
        self.best_peer_height.fetch_max(height, Ordering::Relaxed);
        self.puller.register_peer(peer, height);
        self.puller.update_peer_tip(peer, height);
    }

    pub fn peer_disconnected(&self, peer: PeerId) -> DownloadOrders {
        self.puller.unregister_peer(peer, Instant::now())
    }

    /// Initial block download: the tip is stale or far behind the
    /// best peer.
    pub fn is_ibd(&self) -> bool {
        let tip = self.indexer.tip();
        let now = (self.clock)();

        if u64::from(tip.header.time) + IBD_TIP_AGE_SECS < now {
            return true;
        }

        tip.height + IBD_HEIGHT_LAG < self.best_peer_height.load(Ordering::Relaxed)
    }

    /// Connect a batch of plain headers from a peer.
    ///
    /// A rule failure invalidates the offending subtree and is
    /// reported to the caller, which disconnects and bans the sender.
    pub fn on_headers(
        &self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
    ) -> Result<HeadersOutcome, ConsensusError> {
        self.connect_headers(peer, headers, None)
    }

    /// Connect proven headers; each carries its coinstake proof.
    pub fn on_proven_headers(
        &self,
        peer: PeerId,
        headers: Vec<ProvenHeader>,
    ) -> Result<HeadersOutcome, ConsensusError> {
        let mut connected = 0;
        let mut last: Option<Arc<ChainedHeader>> = None;

        for proven in &headers {
            let chained = self.connect_one(proven.header, Some(proven))?;

            if self
                .block_store
                .put_proven_header(proven)
                .is_err()
            {
                warn!(hash = %proven.hash(), "failed to persist proven header");
            }

            connected += 1;
            last = Some(chained);
        }

        Ok(self.headers_outcome(peer, connected, last))
    }

    fn connect_headers(
        &self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
        proven: Option<&ProvenHeader>,
    ) -> Result<HeadersOutcome, ConsensusError> {
        let mut connected = 0;
        let mut last: Option<Arc<ChainedHeader>> = None;

        for header in headers {
            let chained = self.connect_one(header, proven)?;
            connected += 1;
            last = Some(chained);
        }

        Ok(self.headers_outcome(peer, connected, last))
    }

    fn connect_one(
        &self,
        header: BlockHeader,
        proven: Option<&ProvenHeader>,
    ) -> Result<Arc<ChainedHeader>, ConsensusError> {
        let hash = header.hash();

        if self.invalid.contains(&hash) {
            return Err(ConsensusError::KnownInvalid);
        }

        if let Some(existing) = self.indexer.get_by_hash(&hash) {
            if existing.is_invalid() {
                return Err(ConsensusError::KnownInvalid);
            }
            return Ok(existing);
        }

        let prev = self
            .indexer
            .get_by_hash(&header.prev_hash)
            .ok_or(ConsensusError::HeaderInvalid)?;

        let ctx = HeaderContext {
            params: &self.params,
            header: &header,
            prev: &prev,
            proven,
            now_unix: (self.clock)(),
        };

        if let Err(err) = self.rules.validate_header(&ctx) {
            self.invalid.mark(hash);
            return Err(err);
        }

        let chained = self.indexer.connect(header)?;

        // headers at or under the last checkpoint are assumed valid
        if self
            .params
            .last_checkpoint_height()
            .is_some_and(|pinned| chained.height <= pinned)
        {
            chained.set_state(ValidationState::AssumedValid);
        }

        Ok(chained)
    }

    fn headers_outcome(
        &self,
        peer: PeerId,
        connected: usize,
        last: Option<Arc<ChainedHeader>>,
    ) -> HeadersOutcome {
        let mut download = Vec::new();

        if let Some(candidate) = last {
            self.report_peer_height(peer, candidate.height);

            // fetch the candidate branch back to the fork point,
            // skipping bodies already on disk
            let fork = self.indexer.find_fork(&candidate);
            let mut wanted = Vec::new();
            let mut cursor = candidate;

            while cursor.height > fork.height {
                if !self.block_store.has_block(&cursor.hash).unwrap_or(false) {
                    wanted.push((cursor.hash, cursor.height));
                }
                match cursor.parent() {
                    Some(parent) => cursor = parent.clone(),
                    None => break,
                }
            }

            wanted.reverse();
            download = self.puller.request_blocks(wanted, Instant::now());
        }

        HeadersOutcome {
            connected,
            download,
        }
    }

    /// Accept a block body: integrity rules, persistence, puller
    /// bookkeeping. Partial validation is the caller's next step, off
    /// the hot path.
    pub fn on_block(
        &self,
        peer: PeerId,
        block: Block,
    ) -> Result<Arc<ChainedHeader>, ConsensusError> {
        let hash = block.hash();

        if self.invalid.contains(&hash) {
            return Err(ConsensusError::KnownInvalid);
        }

        // connect the header on the fly when the body precedes it
        let chained = match self.indexer.get_by_hash(&hash) {
            Some(chained) => chained,
            None => self.connect_one(block.header, None)?,
        };

        let ctx = IntegrityContext {
            params: &self.params,
            block: &block,
        };

        if let Err(err) = self.rules.validate_integrity(&ctx) {
            self.invalid.mark(hash);
            self.indexer.invalidate_subtree(&hash);
            return Err(err);
        }

        if let Err(err) = self.block_store.put_block(&block) {
            warn!(%hash, ?err, "failed to persist block body");
        }

        self.puller.block_delivered(peer, &hash, Instant::now());

        Ok(chained)
    }

    /// Run partial validation for a stored block. Worker-pool work:
    /// independent blocks may run concurrently.
    pub fn partial_validate(&self, chained: &Arc<ChainedHeader>) -> Result<(), ConsensusError> {
        match chained.state() {
            ValidationState::Invalid => return Err(ConsensusError::KnownInvalid),
            ValidationState::HeaderValidated => {}
            // assumed-valid, already-partial and fully validated
            // blocks have nothing to prove here
            _ => return Ok(()),
        }

        let block = self
            .block_store
            .get_block(&chained.hash)
            .ok()
            .flatten()
            .ok_or(ConsensusError::HeaderInvalid)?;

        let ctx = PartialContext {
            params: &self.params,
            block: &block,
            height: chained.height,
        };

        if let Err(err) = self.rules.validate_partial(&ctx) {
            self.invalid.mark(chained.hash);
            self.indexer.invalidate_subtree(&chained.hash);
            return Err(err);
        }

        chained.set_state(ValidationState::PartiallyValidated);
        Ok(())
    }

    /// Try to make `candidate` the active tip, reorging if necessary.
    ///
    /// Runs under the chain-writer lock. Disconnect events for the
    /// abandoned branch are published before the first connect event
    /// of the replacing branch.
    pub fn try_activate(
        &self,
        candidate: &Arc<ChainedHeader>,
    ) -> Result<ActivationOutcome, ChainError> {
        let _writer = self.writer.lock().expect("lock is never poisoned");

        let tip = self.indexer.tip();

        if candidate.is_invalid() {
            return Ok(ActivationOutcome::Rejected(ConsensusError::KnownInvalid));
        }

        if candidate.chain_work <= tip.chain_work {
            return Ok(ActivationOutcome::Held);
        }

        let fork = self.indexer.find_fork(candidate);

        // bounded reorg depth
        let depth = tip.height.saturating_sub(fork.height);
        if depth > self.params.max_reorg_length {
            warn!(
                candidate = %candidate.hash,
                depth,
                "refusing reorg beyond the maximum depth"
            );

            let branch_root = candidate
                .ancestor_at(fork.height + 1)
                .map(|h| h.hash)
                .unwrap_or(candidate.hash);
            self.invalid.mark(candidate.hash);
            self.indexer.invalidate_subtree(&branch_root);

            return Ok(ActivationOutcome::Rejected(ConsensusError::MaxReorgViolation));
        }

        // the branch to connect, fork-exclusive, ascending
        let mut branch = Vec::new();
        {
            let mut cursor = candidate.clone();
            while cursor.height > fork.height {
                branch.push(cursor.clone());
                cursor = cursor
                    .parent()
                    .expect("branch walk stops at the fork")
                    .clone();
            }
            branch.reverse();
        }

        // all bodies must be on disk before any state moves
        let mut missing = Vec::new();
        for chained in &branch {
            if !self.block_store.has_block(&chained.hash)? {
                missing.push((chained.hash, chained.height));
            }
        }

        if !missing.is_empty() {
            let orders = self.puller.request_blocks(missing, Instant::now());
            return Ok(ActivationOutcome::NeedBodies(orders));
        }

        // rewind the abandoned branch, tip-down
        if tip.hash != fork.hash {
            info!(
                from = %tip.hash,
                fork = %fork.hash,
                depth,
                "reorganizing active chain"
            );

            let mut cursor = tip.clone();
            while cursor.height > fork.height {
                let body = self
                    .block_store
                    .get_block(&cursor.hash)?
                    .ok_or_else(|| {
                        ChainError::invariant(format!(
                            "active block {} has no stored body",
                            cursor.hash
                        ))
                    })?;

                let new_tip = self.coinview.rewind()?;
                if new_tip != cursor.parent().expect("above fork").hash {
                    return Err(ChainError::invariant(format!(
                        "rewind of {} landed on {new_tip}",
                        cursor.hash
                    )));
                }

                self.events
                    .publish(ChainEvent::BlockDisconnected(ChainedBlock {
                        hash: cursor.hash,
                        height: cursor.height,
                        block: Arc::new(body),
                    }));

                cursor = cursor.parent().expect("above fork").clone();
            }

            self.indexer.set_tip(&fork);
        }

        // connect the new branch, ascending
        for chained in &branch {
            let step = self.validate_and_connect(chained);

            if let Err(err) = step {
                if err.is_fatal() {
                    return Err(err);
                }

                warn!(hash = %chained.hash, %err, "block failed validation during activation");
                let kind = match err {
                    ChainError::Consensus(consensus) => consensus,
                    _ => ConsensusError::KnownInvalid,
                };

                self.invalid.mark(chained.hash);
                self.indexer.invalidate_subtree(&chained.hash);
                self.recover_after_failure(&fork, &tip)?;

                return Ok(ActivationOutcome::Rejected(kind));
            }
        }

        Ok(ActivationOutcome::Activated(self.indexer.tip()))
    }

    fn validate_and_connect(&self, chained: &Arc<ChainedHeader>) -> Result<(), ChainError> {
        let block = self
            .block_store
            .get_block(&chained.hash)?
            .ok_or_else(|| {
                ChainError::invariant(format!("branch block {} disappeared", chained.hash))
            })?;

        if chained.state() == ValidationState::HeaderValidated {
            self.partial_validate(chained)?;
        }

        self.connect_block(chained, &block)
    }

    /// Apply one block to chain state. Caller holds the writer lock
    /// and guarantees the coinview sits at the block's parent.
    fn connect_block(
        &self,
        chained: &Arc<ChainedHeader>,
        block: &Block,
    ) -> Result<(), ChainError> {
        let parent = chained
            .parent()
            .ok_or_else(|| ChainError::invariant("connecting genesis"))?;

        let prev_modifier = self
            .stake_chain
            .get(&parent.hash)?
            .map(|stake| stake.stake_modifier)
            .unwrap_or(Hash::ZERO);

        let outcome = run_full_validation(
            &self.rules,
            &self.params,
            block,
            self.coinview.as_ref(),
            chained.height,
            prev_modifier,
        )?;

        self.coinview
            .apply(chained.hash, parent.hash, outcome.changes)?;

        let stake = match outcome.kernel {
            Some(kernel) => {
                let kernel_hash = crate::stake::StakeValidator::kernel_hash(&kernel);
                BlockStake::for_pos(
                    kernel_hash,
                    prev_modifier,
                    kernel.stake_time,
                    kernel.prev_out,
                )
            }
            None => BlockStake::for_pow(chained.hash, prev_modifier),
        };
        self.stake_chain.put(chained.hash, stake)?;

        chained.set_state(ValidationState::FullyValidated);
        self.indexer.set_tip(chained);

        debug!(hash = %chained.hash, height = chained.height, fees = outcome.total_fees, "connected block");

        self.events.publish(ChainEvent::BlockConnected(ChainedBlock {
            hash: chained.hash,
            height: chained.height,
            block: Arc::new(block.clone()),
        }));

        Ok(())
    }

    /// After a branch failed mid-connect, unwind the partial progress
    /// and restore the chain that was active before the attempt.
    ///
    /// Reconnection of the old branch re-runs full validation; those
    /// blocks passed it before, so a failure here is fatal.
    fn recover_after_failure(
        &self,
        fork: &Arc<ChainedHeader>,
        old_tip: &Arc<ChainedHeader>,
    ) -> Result<(), ChainError> {
        // the coinview sits somewhere on the failed branch; unwind to
        // the fork
        loop {
            let at = self.coinview.tip()?;
            if at.hash == fork.hash {
                break;
            }

            let current = self
                .indexer
                .get_by_hash(&at.hash)
                .ok_or_else(|| ChainError::invariant("coinview tip left the index"))?;

            self.coinview.rewind()?;

            if let Some(body) = self.block_store.get_block(&current.hash)? {
                self.events
                    .publish(ChainEvent::BlockDisconnected(ChainedBlock {
                        hash: current.hash,
                        height: current.height,
                        block: Arc::new(body),
                    }));
            }

            debug!(unwound = %current.hash, "unwound failed branch");
        }

        self.indexer.set_tip(fork);

        if old_tip.hash == fork.hash {
            return Ok(());
        }

        // reconnect the previously active branch, ascending
        let mut old_branch = Vec::new();
        let mut cursor = old_tip.clone();
        while cursor.height > fork.height {
            old_branch.push(cursor.clone());
            cursor = cursor
                .parent()
                .expect("old branch walk stops at the fork")
                .clone();
        }

        for chained in old_branch.iter().rev() {
            let block = self.block_store.get_block(&chained.hash)?.ok_or_else(|| {
                ChainError::invariant(format!(
                    "previously active block {} has no stored body",
                    chained.hash
                ))
            })?;

            self.connect_block(chained, &block).map_err(|err| {
                ChainError::invariant(format!(
                    "failed to restore previously valid block {}: {err}",
                    chained.hash
                ))
            })?;
        }

        Ok(())
    }
}
