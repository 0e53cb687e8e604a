//! Inbound slot reservation for proven-header peers.
//!
//! Proven-header capable peers are the only ones that let the node
//! validate PoS headers ahead of bodies, so a minimum number of
//! inbound slots is held for them: when too few are connected and
//! free slots run short, a legacy peer is evicted on `version`
//! receipt from a non-upgraded peer.

use crate::PeerId;

/// Connected PH-capable peers below which the policy intervenes.
pub const MIN_PROVEN_HEADER_PEERS: usize = 3;

/// Free inbound slots below which the policy intervenes.
pub const FREE_SLOT_THRESHOLD: usize = 4;

/// Facts about one connected inbound peer.
#[derive(Debug, Clone, Copy)]
pub struct InboundPeerSummary {
    pub id: PeerId,
    pub supports_proven_headers: bool,
    pub start_height: i32,
}

/// What to do with a newly versioned inbound peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Accept,
    /// Keep the newcomer, drop this connected legacy peer.
    EvictPeer(PeerId),
    /// No legacy peer to evict; the newcomer itself is dropped.
    RejectNewcomer,
}

/// Decide whether the newcomer may keep its inbound slot.
pub fn reserve_proven_header_slots(
    connected: &[InboundPeerSummary],
    newcomer_supports_ph: bool,
    max_inbound: usize,
) -> SlotDecision {
    if newcomer_supports_ph {
        return SlotDecision::Accept;
    }

    let ph_connected = connected
        .iter()
        .filter(|peer| peer.supports_proven_headers)
        .count();

    let free_slots = max_inbound.saturating_sub(connected.len() + 1);

    if ph_connected >= MIN_PROVEN_HEADER_PEERS || free_slots >= FREE_SLOT_THRESHOLD {
        return SlotDecision::Accept;
    }

    // reserve the slot: drop the least useful legacy peer, or the
    // newcomer when every connected peer is upgraded
    let lowest_legacy = connected
        .iter()
        .filter(|peer| !peer.supports_proven_headers)
        .min_by_key(|peer| peer.start_height);

    match lowest_legacy {
        Some(peer) => SlotDecision::EvictPeer(peer.id),
        None => SlotDecision::RejectNewcomer,
    }
}
