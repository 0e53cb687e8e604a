//! Address gossip: answering `getaddr` and recording `addr` floods.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::addrman::AddressBook;
use crate::message::{NetworkAddress, NetworkMessage, TimestampedAddress};
use crate::peer::PeerHandle;

use super::{Behavior, BehaviorOutcome};

/// Most addresses returned to one `getaddr`.
const MAX_ADDR_RESPONSE: usize = 1000;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct AddressGossipBehavior {
    book: Arc<AddressBook>,
}

impl AddressGossipBehavior {
    pub fn new(book: Arc<AddressBook>) -> Self {
        Self { book }
    }
}

impl Behavior for AddressGossipBehavior {
    fn name(&self) -> &'static str {
        "address-gossip"
    }

    fn handle(&mut self, peer: &Arc<PeerHandle>, message: &NetworkMessage) -> BehaviorOutcome {
        match message {
            NetworkMessage::GetAddr => {
                let now = now_unix();
                let sample = self.book.sample(MAX_ADDR_RESPONSE, now);

                trace!(peer = peer.id, count = sample.len(), "serving addresses");

                let payload: Vec<TimestampedAddress> = sample
                    .into_iter()
                    .map(|address| TimestampedAddress {
                        time: address.last_seen.min(u64::from(u32::MAX)) as u32,
                        address: NetworkAddress::from_socket(address.endpoint, 0),
                    })
                    .collect();

                BehaviorOutcome::reply(NetworkMessage::Addr(payload))
            }

            NetworkMessage::Addr(addresses) => {
                let now = now_unix();
                let source = Some(peer.addr.ip());
                let mut added = 0;

                for stamped in addresses {
                    if self
                        .book
                        .add_discovered(stamped.address.socket_addr(), source, now)
                    {
                        added += 1;
                    }
                }

                trace!(peer = peer.id, added, "addresses recorded");
                BehaviorOutcome::none()
            }

            _ => BehaviorOutcome::none(),
        }
    }
}
