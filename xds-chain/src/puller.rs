//! Per-peer block download scheduling with stall detection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use xds_crypto::Hash;

use crate::PeerId;

/// Ceiling on concurrently requested blocks per peer.
const MAX_IN_FLIGHT_PER_PEER: usize = 16;

/// Delivery samples kept per peer for the latency estimate.
const LATENCY_SAMPLES: usize = 16;

/// Bounds on the adaptive stall timeout.
const MIN_STALL_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Reassignments before a block's subtree is reported unreachable.
const MAX_ATTEMPTS: u32 = 3;

struct PeerState {
    tip_height: u64,
    in_flight: HashSet<Hash<32>>,
    /// Recent delivery latencies, newest last.
    latencies: VecDeque<Duration>,
}

impl PeerState {
    fn stall_timeout(&self) -> Duration {
        if self.latencies.is_empty() {
            return MAX_STALL_TIMEOUT;
        }

        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort();
        let median = sorted[sorted.len() / 2];

        (median * 3).clamp(MIN_STALL_TIMEOUT, MAX_STALL_TIMEOUT)
    }
}

struct Assignment {
    peer: PeerId,
    height: u64,
    requested_at: Instant,
    attempts: u32,
}

#[derive(Default)]
struct PullerState {
    peers: HashMap<PeerId, PeerState>,
    assignments: HashMap<Hash<32>, Assignment>,
    /// Wanted blocks not yet assigned to any peer.
    pending: VecDeque<(Hash<32>, u64)>,
    /// Attempt counts carried across reassignments.
    retry_attempts: HashMap<Hash<32>, u32>,
}

/// Download orders produced by a scheduling pass: per peer, the block
/// hashes to request.
pub type DownloadOrders = Vec<(PeerId, Vec<Hash<32>>)>;

/// Blocks given up on after repeated reassignment; the consensus
/// manager resets their header subtree and asks for fresh headers.
pub type Unreachable = Vec<Hash<32>>;

/// Global scheduler over per-peer download queues.
///
/// Assignment policy: each wanted block goes to the peer with the
/// lowest in-flight count whose advertised tip covers the block's
/// height. Stalls are detected against a moving median of the peer's
/// own delivery latency.
pub struct BlockPuller {
    state: Mutex<PullerState>,
}

impl BlockPuller {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PullerState::default()),
        }
    }

    pub fn register_peer(&self, peer: PeerId, tip_height: u64) {
        let mut state = self.state.lock().expect("lock is never poisoned");

        state.peers.entry(peer).or_insert_with(|| PeerState {
            tip_height,
            in_flight: HashSet::new(),
            latencies: VecDeque::new(),
        });
    }

    pub fn update_peer_tip(&self, peer: PeerId, tip_height: u64) {
        let mut state = self.state.lock().expect("lock is never poisoned");

        if let Some(peer_state) = state.peers.get_mut(&peer) {
            peer_state.tip_height = tip_height;
        }
    }

    /// Drop a peer and move its in-flight blocks back to the front of
    /// the queue.
    pub fn unregister_peer(&self, peer: PeerId, now: Instant) -> DownloadOrders {
        let mut state = self.state.lock().expect("lock is never poisoned");

        if state.peers.remove(&peer).is_none() {
            return Vec::new();
        }

        let orphaned: Vec<(Hash<32>, u64)> = state
            .assignments
            .iter()
            .filter(|(_, a)| a.peer == peer)
            .map(|(hash, a)| (*hash, a.height))
            .collect();

        for (hash, height) in orphaned {
            state.assignments.remove(&hash);
            state.pending.push_front((hash, height));
        }

        debug!(peer, "peer unregistered, blocks requeued");
        self.schedule(&mut state, now)
    }

    /// Queue blocks for download and run a scheduling pass.
    pub fn request_blocks(
        &self,
        wanted: impl IntoIterator<Item = (Hash<32>, u64)>,
        now: Instant,
    ) -> DownloadOrders {
        let mut state = self.state.lock().expect("lock is never poisoned");

        for (hash, height) in wanted {
            let queued = state.assignments.contains_key(&hash)
                || state.pending.iter().any(|(h, _)| *h == hash);

            if !queued {
                state.pending.push_back((hash, height));
            }
        }

        self.schedule(&mut state, now)
    }

    /// Record a delivery. Returns `false` for unsolicited blocks.
    pub fn block_delivered(&self, peer: PeerId, hash: &Hash<32>, now: Instant) -> bool {
        let mut state = self.state.lock().expect("lock is never poisoned");

        match state.assignments.get(hash) {
            Some(assignment) if assignment.peer == peer => {
                let latency = now.duration_since(assignment.requested_at);
                state.assignments.remove(hash);
                state.retry_attempts.remove(hash);

                if let Some(peer_state) = state.peers.get_mut(&peer) {
                    peer_state.in_flight.remove(hash);
                    peer_state.latencies.push_back(latency);
                    while peer_state.latencies.len() > LATENCY_SAMPLES {
                        peer_state.latencies.pop_front();
                    }
                }

                trace!(peer, %hash, ?latency, "block delivered");
                true
            }
            _ => false,
        }
    }

    /// Sweep for stalled assignments; returns new download orders and
    /// the blocks given up on.
    pub fn check_stalls(&self, now: Instant) -> (DownloadOrders, Unreachable) {
        let mut state = self.state.lock().expect("lock is never poisoned");

        let stalled: Vec<Hash<32>> = state
            .assignments
            .iter()
            .filter(|(_, a)| {
                let timeout = state
                    .peers
                    .get(&a.peer)
                    .map(PeerState::stall_timeout)
                    .unwrap_or(MIN_STALL_TIMEOUT);
                now.duration_since(a.requested_at) >= timeout
            })
            .map(|(hash, _)| *hash)
            .collect();

        let mut unreachable = Vec::new();

        for hash in stalled {
            let assignment = state
                .assignments
                .remove(&hash)
                .expect("collected from assignments");

            if let Some(peer_state) = state.peers.get_mut(&assignment.peer) {
                peer_state.in_flight.remove(&hash);
            }

            if assignment.attempts >= MAX_ATTEMPTS {
                // three reassignments already failed
                warn!(%hash, "giving up on block after repeated stalls");
                state.retry_attempts.remove(&hash);
                unreachable.push(hash);
            } else {
                debug!(%hash, peer = assignment.peer, "reassigning stalled block");
                state.retry_attempts.insert(hash, assignment.attempts + 1);
                state.pending.push_front((hash, assignment.height));
            }
        }

        let orders = self.schedule(&mut state, now);
        (orders, unreachable)
    }

    fn schedule(&self, state: &mut PullerState, now: Instant) -> DownloadOrders {
        let mut orders: HashMap<PeerId, Vec<Hash<32>>> = HashMap::new();
        let mut leftover = VecDeque::new();

        while let Some((hash, height)) = state.pending.pop_front() {
            // lowest in-flight count among peers that cover the height
            let candidate = state
                .peers
                .iter()
                .filter(|(_, p)| {
                    p.tip_height >= height && p.in_flight.len() < MAX_IN_FLIGHT_PER_PEER
                })
                .min_by_key(|(_, p)| p.in_flight.len())
                .map(|(id, _)| *id);

            match candidate {
                Some(peer) => {
                    let attempts = state.retry_attempts.get(&hash).copied().unwrap_or(0);

                    state
                        .peers
                        .get_mut(&peer)
                        .expect("candidate exists")
                        .in_flight
                        .insert(hash);
                    state.assignments.insert(
                        hash,
                        Assignment {
                            peer,
                            height,
                            requested_at: now,
                            attempts,
                        },
                    );
                    orders.entry(peer).or_default().push(hash);
                }
                None => leftover.push_back((hash, height)),
            }
        }

        state.pending = leftover;
        orders.into_iter().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state
            .lock()
            .expect("lock is never poisoned")
            .assignments
            .len()
    }
}

impl Default for BlockPuller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(tag: u8) -> Hash<32> {
        Hash::new([tag; 32])
    }

    fn orders_for(orders: &DownloadOrders, peer: PeerId) -> Vec<Hash<32>> {
        orders
            .iter()
            .find(|(id, _)| *id == peer)
            .map(|(_, hashes)| hashes.clone())
            .unwrap_or_default()
    }

    #[test]
    fn assigns_to_covering_peer() {
        let puller = BlockPuller::new();
        let now = Instant::now();

        puller.register_peer(1, 100);
        puller.register_peer(2, 5);

        let orders = puller.request_blocks([(hash(1), 50)], now);

        assert_eq!(orders_for(&orders, 1), vec![hash(1)]);
        assert!(orders_for(&orders, 2).is_empty());
    }

    #[test]
    fn balances_by_in_flight_count() {
        let puller = BlockPuller::new();
        let now = Instant::now();

        puller.register_peer(1, 100);
        puller.register_peer(2, 100);

        let orders = puller.request_blocks([(hash(1), 10), (hash(2), 11)], now);

        assert_eq!(orders_for(&orders, 1).len(), 1);
        assert_eq!(orders_for(&orders, 2).len(), 1);
    }

    #[test]
    fn uncoverable_blocks_stay_pending() {
        let puller = BlockPuller::new();
        let now = Instant::now();

        puller.register_peer(1, 5);
        let orders = puller.request_blocks([(hash(1), 50)], now);

        assert!(orders.is_empty());

        // a taller peer picks the block up on its next pass
        puller.register_peer(2, 100);
        let orders = puller.request_blocks([], now);
        assert_eq!(orders_for(&orders, 2), vec![hash(1)]);
    }

    #[test]
    fn delivery_clears_assignment() {
        let puller = BlockPuller::new();
        let now = Instant::now();

        puller.register_peer(1, 100);
        puller.request_blocks([(hash(1), 10)], now);

        assert!(!puller.block_delivered(2, &hash(1), now), "wrong peer");
        assert!(puller.block_delivered(1, &hash(1), now));
        assert!(!puller.block_delivered(1, &hash(1), now), "already done");
        assert_eq!(puller.in_flight_count(), 0);
    }

    #[test]
    fn disconnect_requeues_to_other_peer() {
        let puller = BlockPuller::new();
        let now = Instant::now();

        puller.register_peer(1, 100);
        puller.request_blocks([(hash(1), 10)], now);

        puller.register_peer(2, 100);
        let orders = puller.unregister_peer(1, now);

        assert_eq!(orders_for(&orders, 2), vec![hash(1)]);
    }

    #[test]
    fn three_stalls_give_up() {
        let puller = BlockPuller::new();
        let mut now = Instant::now();

        puller.register_peer(1, 100);
        puller.request_blocks([(hash(1), 10)], now);

        // fresh peers time out at the ceiling
        for round in 0..3 {
            now += MAX_STALL_TIMEOUT;
            let (orders, unreachable) = puller.check_stalls(now);
            assert!(unreachable.is_empty(), "round {round}");
            assert_eq!(orders_for(&orders, 1), vec![hash(1)]);
        }

        now += MAX_STALL_TIMEOUT;
        let (orders, unreachable) = puller.check_stalls(now);
        assert!(orders.is_empty());
        assert_eq!(unreachable, vec![hash(1)]);
        assert_eq!(puller.in_flight_count(), 0);
    }

    #[test]
    fn fast_peer_gets_short_timeout() {
        let puller = BlockPuller::new();
        let now = Instant::now();

        puller.register_peer(1, 100);
        puller.request_blocks([(hash(1), 10)], now);
        puller.block_delivered(1, &hash(1), now + Duration::from_millis(100));

        // median 100ms * 3 clamps up to the 2s floor
        puller.request_blocks([(hash(2), 11)], now);
        let (_, unreachable) = puller.check_stalls(now + Duration::from_secs(1));
        assert!(unreachable.is_empty());
        assert_eq!(puller.in_flight_count(), 1);

        let (orders, _) = puller.check_stalls(now + Duration::from_secs(3));
        // reassigned after the 2s floor elapsed
        assert_eq!(orders_for(&orders, 1), vec![hash(2)]);
    }
}
