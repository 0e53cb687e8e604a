//! The address book: every endpoint the node has heard about, with
//! connection history, bans and weighted selection for outbound
//! dialing. Persisted to `peers.json` across restarts.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::RwLock;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Addresses accepted from one gossip source.
const MAX_ADDRESSES_PER_SOURCE: usize = 1500;

/// Base retry backoff, doubled per failed attempt.
const RETRY_BACKOFF_SECS: u64 = 60;

/// Lifecycle record of one known endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerAddress {
    pub endpoint: SocketAddr,
    pub first_seen: u64,
    pub last_seen: u64,
    pub last_attempt: Option<u64>,
    pub last_connect: Option<u64>,
    pub last_handshake: Option<u64>,
    pub attempts: u32,
    pub ban_until: Option<u64>,
    /// Gossip source, for the per-source cap.
    pub source: Option<IpAddr>,
}

impl PeerAddress {
    fn fresh(endpoint: SocketAddr, source: Option<IpAddr>, now: u64) -> Self {
        Self {
            endpoint,
            first_seen: now,
            last_seen: now,
            last_attempt: None,
            last_connect: None,
            last_handshake: None,
            attempts: 0,
            ban_until: None,
            source,
        }
    }

    pub fn is_banned(&self, now: u64) -> bool {
        self.ban_until.is_some_and(|until| now < until)
    }

    /// Ever completed a handshake.
    pub fn is_tried(&self) -> bool {
        self.last_handshake.is_some()
    }

    fn ready_for_attempt(&self, now: u64) -> bool {
        if self.is_banned(now) {
            return false;
        }

        match self.last_attempt {
            None => true,
            Some(last) => {
                let backoff = RETRY_BACKOFF_SECS << self.attempts.min(6);
                now.saturating_sub(last) >= backoff
            }
        }
    }
}

#[derive(Default)]
struct BookState {
    addresses: HashMap<SocketAddr, PeerAddress>,
    per_source: HashMap<IpAddr, usize>,
}

/// Registry of known peer addresses.
pub struct AddressBook {
    state: RwLock<BookState>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BookState::default()),
        }
    }

    /// Record a gossiped or configured address. Addresses beyond the
    /// per-source cap are dropped.
    pub fn add_discovered(
        &self,
        endpoint: SocketAddr,
        source: Option<IpAddr>,
        now: u64,
    ) -> bool {
        let mut state = self.state.write().expect("lock is never poisoned");

        if let Some(existing) = state.addresses.get_mut(&endpoint) {
            existing.last_seen = existing.last_seen.max(now);
            return false;
        }

        if let Some(source_ip) = source {
            let count = state.per_source.entry(source_ip).or_insert(0);
            if *count >= MAX_ADDRESSES_PER_SOURCE {
                return false;
            }
            *count += 1;
        }

        state
            .addresses
            .insert(endpoint, PeerAddress::fresh(endpoint, source, now));
        true
    }

    pub fn mark_attempt(&self, endpoint: &SocketAddr, now: u64) {
        let mut state = self.state.write().expect("lock is never poisoned");
        if let Some(address) = state.addresses.get_mut(endpoint) {
            address.last_attempt = Some(now);
            address.attempts += 1;
        }
    }

    pub fn mark_connected(&self, endpoint: &SocketAddr, now: u64) {
        let mut state = self.state.write().expect("lock is never poisoned");
        if let Some(address) = state.addresses.get_mut(endpoint) {
            address.last_connect = Some(now);
        }
    }

    pub fn mark_handshaked(&self, endpoint: &SocketAddr, now: u64) {
        let mut state = self.state.write().expect("lock is never poisoned");
        if let Some(address) = state.addresses.get_mut(endpoint) {
            address.last_handshake = Some(now);
            address.last_seen = now;
            address.attempts = 0;
        }
    }

    pub fn ban(&self, endpoint: &SocketAddr, until: u64) {
        let mut state = self.state.write().expect("lock is never poisoned");
        if let Some(address) = state.addresses.get_mut(endpoint) {
            address.ban_until = Some(until);
            debug!(%endpoint, until, "peer banned");
        }
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<PeerAddress> {
        self.state
            .read()
            .expect("lock is never poisoned")
            .addresses
            .get(endpoint)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .expect("lock is never poisoned")
            .addresses
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Random sample for `addr` gossip replies.
    pub fn sample(&self, limit: usize, now: u64) -> Vec<PeerAddress> {
        let state = self.state.read().expect("lock is never poisoned");

        let mut candidates: Vec<PeerAddress> = state
            .addresses
            .values()
            .filter(|a| !a.is_banned(now))
            .cloned()
            .collect();

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(limit);
        candidates
    }

    /// Pick an endpoint to dial.
    ///
    /// Tried addresses (past handshakes) and new ones form two
    /// buckets; selection flips between them and is weighted toward
    /// recently seen, rarely failed entries.
    pub fn select_for_outbound(
        &self,
        exclude: &[SocketAddr],
        now: u64,
    ) -> Option<SocketAddr> {
        let state = self.state.read().expect("lock is never poisoned");

        let eligible: Vec<&PeerAddress> = state
            .addresses
            .values()
            .filter(|a| a.ready_for_attempt(now) && !exclude.contains(&a.endpoint))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();

        let (tried, fresh): (Vec<&&PeerAddress>, Vec<&&PeerAddress>) =
            eligible.iter().partition(|a| a.is_tried());

        let bucket = if !tried.is_empty() && (fresh.is_empty() || rng.gen_bool(0.5)) {
            tried
        } else {
            fresh
        };

        // weight: recent last-seen and few attempts win
        let weighted: Vec<(u64, SocketAddr)> = bucket
            .iter()
            .map(|a| {
                let staleness_days = now.saturating_sub(a.last_seen) / 86_400;
                let weight = 1_000u64 / (1 + staleness_days + u64::from(a.attempts) * 4);
                (weight.max(1), a.endpoint)
            })
            .collect();

        let total: u64 = weighted.iter().map(|(w, _)| w).sum();
        let mut roll = rng.gen_range(0..total);

        for (weight, endpoint) in weighted {
            if roll < weight {
                return Some(endpoint);
            }
            roll -= weight;
        }

        None
    }

    /// Write the snapshot to `peers.json`.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let state = self.state.read().expect("lock is never poisoned");
        let addresses: Vec<&PeerAddress> = state.addresses.values().collect();

        let json = serde_json::to_string_pretty(&addresses)?;
        std::fs::write(path, json)
    }

    /// Load a snapshot; unknown or unreadable files start empty.
    pub fn load(path: &Path) -> Self {
        let book = Self::new();

        let Ok(raw) = std::fs::read_to_string(path) else {
            return book;
        };

        match serde_json::from_str::<Vec<PeerAddress>>(&raw) {
            Ok(addresses) => {
                let mut state = book.state.write().expect("lock is never poisoned");
                for address in addresses {
                    if let Some(source) = address.source {
                        *state.per_source.entry(source).or_insert(0) += 1;
                    }
                    state.addresses.insert(address.endpoint, address);
                }
                drop(state);
                debug!(count = book.len(), "address book loaded");
            }
            Err(err) => warn!(?err, "peers.json unreadable, starting empty"),
        }

        book
    }
}

impl Default for AddressBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_600_000_000;

    fn endpoint(tag: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, tag], 38333))
    }

    #[test]
    fn lifecycle_transitions_recorded() {
        let book = AddressBook::new();
        let addr = endpoint(1);

        assert!(book.add_discovered(addr, None, NOW));
        book.mark_attempt(&addr, NOW + 1);
        book.mark_connected(&addr, NOW + 2);
        book.mark_handshaked(&addr, NOW + 3);

        let record = book.get(&addr).unwrap();
        assert_eq!(record.first_seen, NOW);
        assert_eq!(record.last_attempt, Some(NOW + 1));
        assert_eq!(record.last_connect, Some(NOW + 2));
        assert_eq!(record.last_handshake, Some(NOW + 3));
        assert_eq!(record.attempts, 0, "handshake resets the attempt count");
        assert!(record.is_tried());
    }

    #[test]
    fn per_source_cap_enforced() {
        let book = AddressBook::new();
        let source: IpAddr = "192.0.2.1".parse().unwrap();

        for index in 0..MAX_ADDRESSES_PER_SOURCE + 10 {
            let port = 1024 + index as u16;
            book.add_discovered(
                SocketAddr::from(([10, 1, 0, 1], port)),
                Some(source),
                NOW,
            );
        }

        assert_eq!(book.len(), MAX_ADDRESSES_PER_SOURCE);
    }

    #[test]
    fn banned_addresses_not_selected() {
        let book = AddressBook::new();
        let addr = endpoint(1);

        book.add_discovered(addr, None, NOW);
        book.ban(&addr, NOW + 8000);

        assert_eq!(book.select_for_outbound(&[], NOW), None);
        assert!(book.sample(10, NOW).is_empty());

        // ban expiry frees the address again
        assert_eq!(book.select_for_outbound(&[], NOW + 8001), Some(addr));
    }

    #[test]
    fn backoff_after_failed_attempts() {
        let book = AddressBook::new();
        let addr = endpoint(1);

        book.add_discovered(addr, None, NOW);
        book.mark_attempt(&addr, NOW);

        assert_eq!(book.select_for_outbound(&[], NOW + 10), None);
        assert_eq!(
            book.select_for_outbound(&[], NOW + 2 * RETRY_BACKOFF_SECS + 1),
            Some(addr)
        );
    }

    #[test]
    fn excluded_addresses_skipped() {
        let book = AddressBook::new();
        book.add_discovered(endpoint(1), None, NOW);

        assert_eq!(book.select_for_outbound(&[endpoint(1)], NOW), None);
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = std::env::temp_dir().join("xds-addrman-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("peers.json");

        let book = AddressBook::new();
        book.add_discovered(endpoint(1), None, NOW);
        book.add_discovered(endpoint(2), Some("192.0.2.1".parse().unwrap()), NOW);
        book.mark_handshaked(&endpoint(1), NOW + 5);
        book.save(&path).unwrap();

        let restored = AddressBook::load(&path);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get(&endpoint(1)), book.get(&endpoint(1)));

        std::fs::remove_file(&path).ok();
    }
}
