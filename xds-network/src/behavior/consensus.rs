//! Headers/blocks exchange between a peer and the local consensus
//! manager.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use xds_chain::manager::{ActivationOutcome, DEFAULT_BAN_SECS};
use xds_chain::{ConsensusManager, ValidationState};
use xds_crypto::Hash;
use xds_primitives::BlockHeader;

use crate::message::{BlockLocator, InvItem, InvKind, NetworkMessage};
use crate::peer::PeerHandle;

use super::{Behavior, BehaviorOutcome};

/// Most headers served per `getheaders` response.
const MAX_HEADERS_PER_MESSAGE: usize = 2000;

pub struct ConsensusBehavior {
    manager: Arc<ConsensusManager>,
}

impl ConsensusBehavior {
    pub fn new(manager: Arc<ConsensusManager>) -> Self {
        Self { manager }
    }

    /// Build the locator for our current best chain.
    pub fn our_locator(&self) -> BlockLocator {
        let indexer = self.manager.indexer();
        let tip = indexer.tip();

        let mut have = Vec::new();
        let mut height = tip.height as i64;
        let mut step = 1i64;

        while height >= 0 {
            if let Some(header) = indexer.get_by_height(height as u64) {
                have.push(header.hash);
            }

            if have.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }

        BlockLocator {
            have,
            stop: Hash::ZERO,
        }
    }

    fn serve_headers(&self, locator: &BlockLocator) -> Vec<BlockHeader> {
        let indexer = self.manager.indexer();

        // first locator hash found on our best chain anchors the reply
        let start_height = locator
            .have
            .iter()
            .filter_map(|hash| indexer.get_by_hash(hash))
            .find(|header| indexer.is_on_best_chain(header))
            .map(|header| header.height + 1)
            .unwrap_or(1);

        let mut headers = Vec::new();
        let mut height = start_height;

        while headers.len() < MAX_HEADERS_PER_MESSAGE {
            let Some(chained) = indexer.get_by_height(height) else {
                break;
            };

            headers.push(chained.header);

            if !locator.stop.is_zero() && chained.hash == locator.stop {
                break;
            }
            height += 1;
        }

        headers
    }

    fn wanted_blocks(&self, items: &[InvItem]) -> Vec<InvItem> {
        items
            .iter()
            .filter(|item| matches!(item.kind, InvKind::Block | InvKind::ProvenBlock))
            .filter(|item| {
                match self.manager.indexer().get_by_hash(&item.hash) {
                    // known header: fetch only when the body is still
                    // missing and the header may yet advance the chain
                    Some(header) => {
                        header.state() == ValidationState::HeaderValidated
                            && self
                                .manager
                                .get_block_query(&item.hash)
                                .ok()
                                .flatten()
                                .is_none()
                    }
                    // unknown: ask for it, the header comes with it
                    None => true,
                }
            })
            .copied()
            .collect()
    }

    fn on_block(&self, peer: &Arc<PeerHandle>, block: xds_primitives::Block) -> BehaviorOutcome {
        let hash = block.hash();

        let chained = match self.manager.on_block(peer.id, block) {
            Ok(chained) => chained,
            Err(err) if err.bans_peer() => {
                warn!(peer = peer.id, %hash, kind = err.kind(), "invalid block");
                return BehaviorOutcome::ban(DEFAULT_BAN_SECS);
            }
            Err(err) => {
                debug!(peer = peer.id, %hash, kind = err.kind(), "block not accepted");
                return BehaviorOutcome::none();
            }
        };

        if let Err(err) = self.manager.partial_validate(&chained) {
            warn!(peer = peer.id, %hash, kind = err.kind(), "partial validation failed");
            return BehaviorOutcome::ban(DEFAULT_BAN_SECS);
        }

        match self.manager.try_activate(&chained) {
            Ok(ActivationOutcome::Activated(tip)) => {
                debug!(height = tip.height, "chain advanced");
                BehaviorOutcome::none()
            }
            Ok(ActivationOutcome::NeedBodies(orders)) => {
                // request the bodies this peer owes us
                let wanted: Vec<InvItem> = orders
                    .into_iter()
                    .filter(|(peer_id, _)| *peer_id == peer.id)
                    .flat_map(|(_, hashes)| hashes)
                    .map(InvItem::block)
                    .collect();

                if wanted.is_empty() {
                    BehaviorOutcome::none()
                } else {
                    BehaviorOutcome::reply(NetworkMessage::GetData(wanted))
                }
            }
            Ok(ActivationOutcome::Held) | Ok(ActivationOutcome::Rejected(_)) => {
                BehaviorOutcome::none()
            }
            Err(err) => {
                warn!(%hash, %err, "activation failed");
                BehaviorOutcome::none()
            }
        }
    }
}

impl Behavior for ConsensusBehavior {
    fn name(&self) -> &'static str {
        "consensus"
    }

    fn handle(&mut self, peer: &Arc<PeerHandle>, message: &NetworkMessage) -> BehaviorOutcome {
        match message {
            NetworkMessage::Version(version) => {
                self.manager
                    .report_peer_height(peer.id, version.start_height.max(0) as u64);
                BehaviorOutcome::none()
            }

            NetworkMessage::Headers(headers) => {
                match self.manager.on_headers(peer.id, headers.clone()) {
                    Ok(outcome) => {
                        trace!(peer = peer.id, connected = outcome.connected, "headers connected");

                        let wanted: Vec<InvItem> = outcome
                            .download
                            .into_iter()
                            .filter(|(peer_id, _)| *peer_id == peer.id)
                            .flat_map(|(_, hashes)| hashes)
                            .map(InvItem::block)
                            .collect();

                        if wanted.is_empty() {
                            BehaviorOutcome::none()
                        } else {
                            BehaviorOutcome::reply(NetworkMessage::GetData(wanted))
                        }
                    }
                    Err(err) if err.bans_peer() => {
                        warn!(peer = peer.id, kind = err.kind(), "header rules failed");
                        BehaviorOutcome::ban(DEFAULT_BAN_SECS)
                    }
                    Err(err) => {
                        debug!(peer = peer.id, kind = err.kind(), "headers ignored");
                        BehaviorOutcome::none()
                    }
                }
            }

            NetworkMessage::ProvenHeaders(headers) => {
                match self.manager.on_proven_headers(peer.id, headers.clone()) {
                    Ok(outcome) => {
                        let wanted: Vec<InvItem> = outcome
                            .download
                            .into_iter()
                            .filter(|(peer_id, _)| *peer_id == peer.id)
                            .flat_map(|(_, hashes)| hashes)
                            .map(InvItem::block)
                            .collect();

                        if wanted.is_empty() {
                            BehaviorOutcome::none()
                        } else {
                            BehaviorOutcome::reply(NetworkMessage::GetData(wanted))
                        }
                    }
                    Err(err) if err.bans_peer() => BehaviorOutcome::ban(DEFAULT_BAN_SECS),
                    Err(_) => BehaviorOutcome::none(),
                }
            }

            NetworkMessage::Inv(items) => {
                let wanted = self.wanted_blocks(items);

                if wanted.is_empty() {
                    BehaviorOutcome::none()
                } else {
                    BehaviorOutcome::reply(NetworkMessage::GetData(wanted))
                }
            }

            NetworkMessage::GetHeaders(locator) => {
                let headers = self.serve_headers(locator);
                trace!(peer = peer.id, count = headers.len(), "serving headers");
                BehaviorOutcome::reply(NetworkMessage::Headers(headers))
            }

            NetworkMessage::GetData(items) => {
                let mut replies = Vec::new();
                let mut not_found = Vec::new();

                for item in items {
                    if !matches!(item.kind, InvKind::Block | InvKind::ProvenBlock) {
                        continue;
                    }

                    match self.manager.get_block_query(&item.hash) {
                        Ok(Some(block)) => replies.push(NetworkMessage::Block(block)),
                        _ => not_found.push(*item),
                    }
                }

                if !not_found.is_empty() {
                    replies.push(NetworkMessage::NotFound(not_found));
                }

                BehaviorOutcome::replies(replies)
            }

            NetworkMessage::Block(block) => self.on_block(peer, block.clone()),

            _ => BehaviorOutcome::none(),
        }
    }

    fn on_disconnected(&mut self, peer: &Arc<PeerHandle>) {
        let orders = self.manager.peer_disconnected(peer.id);
        if !orders.is_empty() {
            debug!(peer = peer.id, "in-flight blocks reassigned after disconnect");
        }
    }
}
