//! Events published by the networking layer.

use std::net::SocketAddr;

use crate::peer::Direction;
use crate::PeerId;

/// Peer lifecycle and traffic notifications, consumed by telemetry
/// and the API surface.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionAttempt {
        addr: SocketAddr,
    },
    ConnectionAttemptFailed {
        addr: SocketAddr,
    },
    Connected {
        peer: PeerId,
        addr: SocketAddr,
        direction: Direction,
    },
    Disconnected {
        peer: PeerId,
        addr: SocketAddr,
    },
    MessageReceived {
        peer: PeerId,
        command: &'static str,
    },
    MessageSent {
        peer: PeerId,
        command: &'static str,
    },
    SendFailure {
        peer: PeerId,
        command: &'static str,
    },
}
