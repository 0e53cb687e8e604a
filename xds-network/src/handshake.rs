//! The version/verack handshake as an explicit state machine.
//!
//! The machine is I/O-free: callers feed inbound messages and drain
//! outbound ones, so the protocol logic is testable without sockets
//! and the async driver stays a thin loop.

use std::net::SocketAddr;

use tracing::debug;

use xds_primitives::NetworkParams;

use crate::error::NetworkError;
use crate::message::{NetworkMessage, NetworkAddress, VersionPayload};
use crate::peer::Direction;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Outbound: our version is on the wire. Inbound: waiting for
    /// the peer to open.
    Start,
    /// Version exchanged one way; awaiting the counterpart.
    VersionReceived,
    /// Both versions seen, awaiting or having sent verack.
    VerackExchange,
    Done,
}

/// Negotiated facts about the remote, available once `Done`.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub version: u32,
    pub services: u64,
    pub start_height: i32,
    pub user_agent: String,
    pub relay: bool,
    /// Protocol version implies proven-header support.
    pub supports_proven_headers: bool,
}

pub struct Handshake {
    state: State,
    direction: Direction,
    params: NetworkParams,
    local_nonce: u64,
    local_height: i32,
    remote: Option<VersionPayload>,
    verack_received: bool,
    verack_sent: bool,
    outbound: Vec<NetworkMessage>,
}

impl Handshake {
    /// Start a handshake; outbound connections speak first.
    pub fn new(
        params: NetworkParams,
        direction: Direction,
        peer_addr: SocketAddr,
        local_height: i32,
        local_nonce: u64,
    ) -> Self {
        let mut machine = Self {
            state: State::Start,
            direction,
            params,
            local_nonce,
            local_height,
            remote: None,
            verack_received: false,
            verack_sent: false,
            outbound: Vec::new(),
        };

        if direction == Direction::Outbound {
            let version = machine.local_version(peer_addr);
            machine.outbound.push(NetworkMessage::Version(version));
        }

        machine
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// The negotiated facts; `None` until the handshake completes.
    pub fn negotiated(&self) -> Option<Negotiated> {
        if !self.is_done() {
            return None;
        }

        self.remote.as_ref().map(|remote| Negotiated {
            version: remote.version,
            services: remote.services,
            start_height: remote.start_height,
            user_agent: remote.user_agent.clone(),
            relay: remote.relay,
            supports_proven_headers: remote.version >= self.params.proven_header_version,
        })
    }

    /// Messages to put on the wire, in order.
    pub fn drain_outbound(&mut self) -> Vec<NetworkMessage> {
        std::mem::take(&mut self.outbound)
    }

    /// Advance the machine with one inbound message.
    pub fn on_message(&mut self, message: NetworkMessage, peer_addr: SocketAddr) -> Result<(), NetworkError> {
        match (self.state, message) {
            (
                State::Start | State::VersionReceived | State::VerackExchange,
                NetworkMessage::Version(remote),
            ) if self.remote.is_none() =>
            {
                if remote.nonce == self.local_nonce {
                    return Err(NetworkError::SelfConnection);
                }

                if remote.version < MIN_PROTOCOL_VERSION {
                    return Err(NetworkError::VersionTooLow(remote.version));
                }

                debug!(
                    version = remote.version,
                    agent = %remote.user_agent,
                    "peer version received"
                );

                // inbound peers answer with their own version
                if self.direction == Direction::Inbound {
                    let version = self.local_version(peer_addr);
                    self.outbound.push(NetworkMessage::Version(version));
                }

                self.outbound.push(NetworkMessage::Verack);
                self.verack_sent = true;
                self.remote = Some(remote);
                self.state = if self.verack_received {
                    State::Done
                } else {
                    State::VerackExchange
                };

                Ok(())
            }
            (State::Start | State::VersionReceived | State::VerackExchange, NetworkMessage::Verack)
                if !self.verack_received =>
            {
                self.verack_received = true;

                self.state = if self.remote.is_some() && self.verack_sent {
                    State::Done
                } else {
                    State::VersionReceived
                };

                Ok(())
            }
            _ => Err(NetworkError::HandshakeOutOfOrder),
        }
    }

    fn local_version(&self, peer_addr: SocketAddr) -> VersionPayload {
        VersionPayload {
            version: self.params.protocol_version,
            services: NODE_NETWORK,
            timestamp: 0,
            receiver: NetworkAddress::from_socket(peer_addr, 0),
            sender: NetworkAddress::from_socket(
                SocketAddr::from(([0, 0, 0, 0], self.params.default_port)),
                NODE_NETWORK,
            ),
            nonce: self.local_nonce,
            user_agent: USER_AGENT.to_string(),
            start_height: self.local_height,
            relay: true,
        }
    }
}

/// Services bitmap: full chain served.
pub const NODE_NETWORK: u64 = 1;

/// Oldest protocol version still spoken to.
pub const MIN_PROTOCOL_VERSION: u32 = 70_000;

pub const USER_AGENT: &str = "/xds-rs:0.1.0/";

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.9:38333".parse().unwrap()
    }

    fn drive_both() -> (Handshake, Handshake) {
        let params = NetworkParams::mainnet();

        let mut alice = Handshake::new(params.clone(), Direction::Outbound, addr(), 10, 1);
        let mut bob = Handshake::new(params, Direction::Inbound, addr(), 20, 2);

        // shuttle messages until both sides go quiet
        loop {
            let from_alice = alice.drain_outbound();
            let from_bob = bob.drain_outbound();

            if from_alice.is_empty() && from_bob.is_empty() {
                break;
            }

            for message in from_alice {
                bob.on_message(message, addr()).unwrap();
            }
            for message in from_bob {
                alice.on_message(message, addr()).unwrap();
            }
        }

        (alice, bob)
    }

    #[test]
    fn both_directions_complete() {
        let (alice, bob) = drive_both();

        assert!(alice.is_done());
        assert!(bob.is_done());

        let negotiated = alice.negotiated().unwrap();
        assert_eq!(negotiated.start_height, 20);
        assert!(negotiated.supports_proven_headers);
    }

    #[test]
    fn self_connection_detected() {
        let params = NetworkParams::mainnet();

        let mut alice = Handshake::new(params.clone(), Direction::Outbound, addr(), 0, 99);
        let version = alice.drain_outbound().remove(0);

        // the same nonce comes straight back
        let result = alice.on_message(version, addr());
        assert!(matches!(result, Err(NetworkError::SelfConnection)));
    }

    #[test]
    fn ancient_peer_rejected() {
        let params = NetworkParams::mainnet();
        let mut bob = Handshake::new(params.clone(), Direction::Inbound, addr(), 0, 2);

        let mut alice = Handshake::new(params, Direction::Outbound, addr(), 0, 1);
        let NetworkMessage::Version(mut version) = alice.drain_outbound().remove(0) else {
            panic!("outbound handshake opens with version");
        };
        version.version = 60_000;

        let result = bob.on_message(NetworkMessage::Version(version), addr());
        assert!(matches!(result, Err(NetworkError::VersionTooLow(60_000))));
    }

    #[test]
    fn duplicate_version_rejected() {
        let params = NetworkParams::mainnet();
        let mut bob = Handshake::new(params.clone(), Direction::Inbound, addr(), 0, 2);

        let mut alice = Handshake::new(params, Direction::Outbound, addr(), 0, 1);
        let NetworkMessage::Version(version) = alice.drain_outbound().remove(0) else {
            panic!("outbound handshake opens with version");
        };

        bob.on_message(NetworkMessage::Version(version.clone()), addr())
            .unwrap();
        let result = bob.on_message(NetworkMessage::Version(version), addr());

        assert!(matches!(result, Err(NetworkError::HandshakeOutOfOrder)));
    }

    #[test]
    fn data_before_handshake_rejected() {
        let params = NetworkParams::mainnet();
        let mut bob = Handshake::new(params, Direction::Inbound, addr(), 0, 2);

        let result = bob.on_message(NetworkMessage::Ping(1), addr());
        assert!(matches!(result, Err(NetworkError::HandshakeOutOfOrder)));
    }
}
