//! Events published by the chain core.

use std::sync::Arc;

use xds_crypto::Hash;
use xds_primitives::{Block, Transaction};

/// A block together with its chain position, as delivered to event
/// subscribers.
#[derive(Debug, Clone)]
pub struct ChainedBlock {
    pub hash: Hash<32>,
    pub height: u64,
    pub block: Arc<Block>,
}

/// Chain-state notifications consumed by the mempool, wallet, miner
/// and API surfaces.
///
/// Ordering guarantees: `BlockConnected` events arrive in chain
/// order; during a reorg every `BlockDisconnected` precedes the first
/// `BlockConnected` of the replacing branch.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    BlockConnected(ChainedBlock),
    BlockDisconnected(ChainedBlock),
    TransactionReceived(Arc<Transaction>),
}
