//! Transaction relay: inv/getdata/tx plumbing into the mempool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

use xds_chain::coinview::CoinView;
use xds_chain::ConsensusManager;
use xds_mempool::{Mempool, MempoolError};

use crate::message::{InvItem, InvKind, NetworkMessage};
use crate::peer::PeerHandle;

use super::{Behavior, BehaviorOutcome};

/// Transaction inventory entries accepted from one peer per window.
const MAX_TX_INVS_PER_WINDOW: usize = 1000;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct TxRelayBehavior {
    mempool: Arc<Mempool>,
    manager: Arc<ConsensusManager>,
    coinview: Arc<dyn CoinView>,
    /// Announcements already requested from this peer.
    requested: HashSet<xds_crypto::Hash<32>>,
    window_start: u64,
    window_invs: usize,
}

impl TxRelayBehavior {
    pub fn new(
        mempool: Arc<Mempool>,
        manager: Arc<ConsensusManager>,
        coinview: Arc<dyn CoinView>,
    ) -> Self {
        Self {
            mempool,
            manager,
            coinview,
            requested: HashSet::new(),
            window_start: 0,
            window_invs: 0,
        }
    }

    fn within_rate(&mut self, additional: usize, now: u64) -> bool {
        if now.saturating_sub(self.window_start) >= 60 {
            self.window_start = now;
            self.window_invs = 0;
        }

        self.window_invs += additional;
        self.window_invs <= MAX_TX_INVS_PER_WINDOW
    }
}

impl Behavior for TxRelayBehavior {
    fn name(&self) -> &'static str {
        "tx-relay"
    }

    fn handle(&mut self, peer: &Arc<PeerHandle>, message: &NetworkMessage) -> BehaviorOutcome {
        match message {
            NetworkMessage::Inv(items) => {
                // transactions are not pulled during initial sync
                if self.manager.is_ibd() {
                    return BehaviorOutcome::none();
                }

                let tx_items: Vec<&InvItem> = items
                    .iter()
                    .filter(|item| item.kind == InvKind::Tx)
                    .collect();

                if tx_items.is_empty() {
                    return BehaviorOutcome::none();
                }

                if !self.within_rate(tx_items.len(), now_unix()) {
                    debug!(peer = peer.id, "tx inventory rate limit hit");
                    return BehaviorOutcome::none();
                }

                let wanted: Vec<InvItem> = tx_items
                    .into_iter()
                    .filter(|item| {
                        !self.mempool.contains(&item.hash) && self.requested.insert(item.hash)
                    })
                    .copied()
                    .collect();

                if wanted.is_empty() {
                    BehaviorOutcome::none()
                } else {
                    BehaviorOutcome::reply(NetworkMessage::GetData(wanted))
                }
            }

            NetworkMessage::GetData(items) => {
                let mut replies = Vec::new();
                let mut not_found = Vec::new();

                for item in items.iter().filter(|item| item.kind == InvKind::Tx) {
                    match self.mempool.get(&item.hash) {
                        Some(entry) => replies.push(NetworkMessage::Tx((*entry.tx).clone())),
                        None => not_found.push(*item),
                    }
                }

                if !not_found.is_empty() {
                    replies.push(NetworkMessage::NotFound(not_found));
                }

                BehaviorOutcome::replies(replies)
            }

            NetworkMessage::Tx(tx) => {
                let txid = tx.txid();
                self.requested.remove(&txid);

                let tip_height = self.manager.tip().height;

                match self.mempool.accept(
                    tx.clone(),
                    self.coinview.as_ref(),
                    tip_height,
                    now_unix(),
                ) {
                    Ok(()) => {
                        trace!(peer = peer.id, %txid, "transaction relayed into pool");
                        BehaviorOutcome::none()
                    }
                    Err(MempoolError::AlreadyInPool) => BehaviorOutcome::none(),
                    Err(err) => {
                        debug!(peer = peer.id, %txid, kind = err.kind(), "relayed tx refused");
                        BehaviorOutcome::none()
                    }
                }
            }

            _ => BehaviorOutcome::none(),
        }
    }
}
