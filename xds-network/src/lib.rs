//! Peer-to-peer networking for the XDS node: message framing, the
//! wire protocol, peer sessions and the per-peer behaviors that plug
//! the network into consensus and the mempool.

pub mod addrman;
pub mod behavior;
pub mod error;
pub mod events;
pub mod framing;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod slots;

pub use error::NetworkError;
pub use events::PeerEvent;
pub use framing::FramedStream;
pub use message::NetworkMessage;
pub use peer::{Direction, PeerState};

/// Identifier for a connected peer; shared with the consensus layer.
pub type PeerId = xds_chain::PeerId;
