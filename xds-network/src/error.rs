//! Transport and protocol errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no data available on the connection")]
    ConnectionClosed,

    #[error("unexpected I/O error")]
    Io(#[from] tokio::io::Error),

    #[error("message from a different network")]
    WrongNetwork { expected: u32, found: u32 },

    #[error("frame checksum does not match the payload")]
    BadChecksum,

    #[error("frame payload exceeds the protocol limit ({0} bytes)")]
    OversizedPayload(usize),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("malformed payload")]
    Format(#[from] xds_codec::Error),

    #[error("handshake violated the protocol state machine")]
    HandshakeOutOfOrder,

    #[error("peer speaks protocol version {0}, below the minimum")]
    VersionTooLow(u32),

    #[error("connected to ourselves")]
    SelfConnection,

    #[error(transparent)]
    Cancelled(#[from] xds_runtime::Cancelled),
}
