//! The wire protocol: typed messages and their payload codecs.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use xds_codec::{decode_list, encode_list, Decode, Encode, VarInt};
use xds_crypto::Hash;
use xds_primitives::{Block, BlockHeader, ProvenHeader, Transaction};

use crate::error::NetworkError;

/// Inventory item kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    Tx,
    Block,
    /// Block announced by a proven-header peer.
    ProvenBlock,
}

impl InvKind {
    fn to_u32(self) -> u32 {
        match self {
            Self::Tx => 1,
            Self::Block => 2,
            Self::ProvenBlock => 7,
        }
    }

    fn from_u32(value: u32) -> Result<Self, xds_codec::Error> {
        match value {
            1 => Ok(Self::Tx),
            2 => Ok(Self::Block),
            7 => Ok(Self::ProvenBlock),
            _ => Err(xds_codec::Error::InvalidValue("inventory kind")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash<32>,
}

impl InvItem {
    pub fn tx(hash: Hash<32>) -> Self {
        Self {
            kind: InvKind::Tx,
            hash,
        }
    }

    pub fn block(hash: Hash<32>) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }
}

impl Encode for InvItem {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), xds_codec::Error> {
        self.kind.to_u32().encode(w)?;
        self.hash.encode(w)
    }
}

impl Decode for InvItem {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, xds_codec::Error> {
        Ok(Self {
            kind: InvKind::from_u32(u32::decode(r)?)?,
            hash: Hash::decode(r)?,
        })
    }
}

/// Network endpoint in the 16-byte mapped form used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn from_socket(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };

        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);

        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }
}

impl Encode for NetworkAddress {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), xds_codec::Error> {
        self.services.encode(w)?;
        self.ip.encode(w)?;
        // port is big-endian on the wire, the one exception
        w.write_all(&self.port.to_be_bytes())
            .map_err(xds_codec::Error::Io)
    }
}

impl Decode for NetworkAddress {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, xds_codec::Error> {
        let services = u64::decode(r)?;
        let ip = <[u8; 16]>::decode(r)?;
        let port_bytes = <[u8; 2]>::decode(r)?;

        Ok(Self {
            services,
            ip,
            port: u16::from_be_bytes(port_bytes),
        })
    }
}

/// An address with its last-seen time, as relayed in `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddress {
    pub time: u32,
    pub address: NetworkAddress,
}

impl Encode for TimestampedAddress {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), xds_codec::Error> {
        self.time.encode(w)?;
        self.address.encode(w)
    }
}

impl Decode for TimestampedAddress {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, xds_codec::Error> {
        Ok(Self {
            time: u32::decode(r)?,
            address: NetworkAddress::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetworkAddress,
    pub sender: NetworkAddress,
    /// Random per-connection value for self-connection detection.
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl Encode for VersionPayload {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), xds_codec::Error> {
        self.version.encode(w)?;
        self.services.encode(w)?;
        self.timestamp.encode(w)?;
        self.receiver.encode(w)?;
        self.sender.encode(w)?;
        self.nonce.encode(w)?;
        self.user_agent.as_bytes().to_vec().encode(w)?;
        self.start_height.encode(w)?;
        self.relay.encode(w)
    }
}

impl Decode for VersionPayload {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, xds_codec::Error> {
        Ok(Self {
            version: u32::decode(r)?,
            services: u64::decode(r)?,
            timestamp: i64::decode(r)?,
            receiver: NetworkAddress::decode(r)?,
            sender: NetworkAddress::decode(r)?,
            nonce: u64::decode(r)?,
            user_agent: String::from_utf8(Vec::decode(r)?)
                .map_err(|_| xds_codec::Error::InvalidValue("user agent"))?,
            start_height: i32::decode(r)?,
            relay: bool::decode(r)?,
        })
    }
}

/// Compact description of the caller's chain for `getheaders`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    /// Block hashes, densest near the tip, sparser toward genesis.
    pub have: Vec<Hash<32>>,
    /// Stop hash, zero for "as many as possible".
    pub stop: Hash<32>,
}

impl Encode for BlockLocator {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), xds_codec::Error> {
        encode_list(&self.have, w)?;
        self.stop.encode(w)
    }
}

impl Decode for BlockLocator {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, xds_codec::Error> {
        Ok(Self {
            have: decode_list(r)?,
            stop: Hash::decode(r)?,
        })
    }
}

/// Every message the node speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionPayload),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<TimestampedAddress>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetHeaders(BlockLocator),
    Headers(Vec<BlockHeader>),
    ProvenHeaders(Vec<ProvenHeader>),
    Block(Block),
    Tx(Transaction),
}

impl NetworkMessage {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Version(_) => "version",
            Self::Verack => "verack",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::GetAddr => "getaddr",
            Self::Addr(_) => "addr",
            Self::Inv(_) => "inv",
            Self::GetData(_) => "getdata",
            Self::NotFound(_) => "notfound",
            Self::GetHeaders(_) => "getheaders",
            Self::Headers(_) => "headers",
            Self::ProvenHeaders(_) => "provhdrs",
            Self::Block(_) => "block",
            Self::Tx(_) => "tx",
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            Self::Verack | Self::GetAddr => Vec::new(),
            Self::Version(p) => p.to_bytes(),
            Self::Ping(nonce) | Self::Pong(nonce) => nonce.to_bytes(),
            Self::Addr(addrs) => {
                let mut out = Vec::new();
                encode_list(addrs, &mut out).expect("encoding to a vec is infallible");
                out
            }
            Self::Inv(items) | Self::GetData(items) | Self::NotFound(items) => {
                let mut out = Vec::new();
                encode_list(items, &mut out).expect("encoding to a vec is infallible");
                out
            }
            Self::GetHeaders(locator) => locator.to_bytes(),
            Self::Headers(headers) => {
                let mut out = Vec::new();
                VarInt(headers.len() as u64)
                    .encode(&mut out)
                    .expect("encoding to a vec is infallible");
                for header in headers {
                    header.encode(&mut out).expect("encoding to a vec is infallible");
                    // trailing tx count, always zero in headers messages
                    VarInt(0).encode(&mut out).expect("encoding to a vec is infallible");
                }
                out
            }
            Self::ProvenHeaders(headers) => {
                let mut out = Vec::new();
                encode_list(headers, &mut out).expect("encoding to a vec is infallible");
                out
            }
            Self::Block(block) => block.to_bytes(),
            Self::Tx(tx) => tx.to_bytes(),
        }
    }

    /// Decode a message from its command string and payload.
    pub fn from_wire(command: &str, payload: &[u8]) -> Result<Self, NetworkError> {
        let message = match command {
            "version" => Self::Version(VersionPayload::from_bytes(payload)?),
            "verack" => Self::Verack,
            "ping" => Self::Ping(u64::from_bytes(payload)?),
            "pong" => Self::Pong(u64::from_bytes(payload)?),
            "getaddr" => Self::GetAddr,
            "addr" => {
                let mut cursor = io::Cursor::new(payload);
                Self::Addr(decode_list(&mut cursor)?)
            }
            "inv" => {
                let mut cursor = io::Cursor::new(payload);
                Self::Inv(decode_list(&mut cursor)?)
            }
            "getdata" => {
                let mut cursor = io::Cursor::new(payload);
                Self::GetData(decode_list(&mut cursor)?)
            }
            "notfound" => {
                let mut cursor = io::Cursor::new(payload);
                Self::NotFound(decode_list(&mut cursor)?)
            }
            "getheaders" => Self::GetHeaders(BlockLocator::from_bytes(payload)?),
            "headers" => {
                let mut cursor = io::Cursor::new(payload);
                let count = xds_codec::checked_len(VarInt::decode(&mut cursor)?.0)?;
                let mut headers = Vec::with_capacity(count.min(2000));
                for _ in 0..count {
                    headers.push(BlockHeader::decode(&mut cursor)?);
                    // discard the conventional zero tx count
                    VarInt::decode(&mut cursor)?;
                }
                Self::Headers(headers)
            }
            "provhdrs" => {
                let mut cursor = io::Cursor::new(payload);
                Self::ProvenHeaders(decode_list(&mut cursor)?)
            }
            "block" => Self::Block(Block::from_bytes(payload)?),
            "tx" => Self::Tx(Transaction::from_bytes(payload)?),
            other => return Err(NetworkError::UnknownCommand(other.to_string())),
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xds_primitives::CompactTarget;

    fn roundtrip(message: NetworkMessage) {
        let command = message.command();
        let payload = message.payload();
        let back = NetworkMessage::from_wire(command, &payload).unwrap();
        assert_eq!(message, back);
    }

    fn sample_address() -> NetworkAddress {
        NetworkAddress::from_socket("203.0.113.9:38333".parse().unwrap(), 1)
    }

    fn sample_header(tag: u8) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash::new([tag; 32]),
            merkle_root: Hash::new([tag ^ 0xff; 32]),
            time: 1_578_008_176,
            bits: CompactTarget(0x1e0f_ffff),
            nonce: u32::from(tag),
        }
    }

    #[test]
    fn control_messages_roundtrip() {
        roundtrip(NetworkMessage::Verack);
        roundtrip(NetworkMessage::GetAddr);
        roundtrip(NetworkMessage::Ping(0xdead_beef));
        roundtrip(NetworkMessage::Pong(42));
    }

    #[test]
    fn version_roundtrip() {
        roundtrip(NetworkMessage::Version(VersionPayload {
            version: 70_012,
            services: 1,
            timestamp: 1_578_008_160,
            receiver: sample_address(),
            sender: sample_address(),
            nonce: 7,
            user_agent: "/xds-rs:0.1.0/".into(),
            start_height: 1042,
            relay: true,
        }));
    }

    #[test]
    fn inventory_roundtrip() {
        roundtrip(NetworkMessage::Inv(vec![
            InvItem::tx(Hash::new([1; 32])),
            InvItem::block(Hash::new([2; 32])),
            InvItem {
                kind: InvKind::ProvenBlock,
                hash: Hash::new([3; 32]),
            },
        ]));
    }

    #[test]
    fn headers_roundtrip_with_tx_count_padding() {
        roundtrip(NetworkMessage::Headers(vec![
            sample_header(1),
            sample_header(2),
        ]));

        // each header entry is 80 bytes plus the zero tx count
        let payload = NetworkMessage::Headers(vec![sample_header(1)]).payload();
        assert_eq!(payload.len(), 1 + 80 + 1);
    }

    #[test]
    fn addr_roundtrip_maps_ipv4() {
        let address = sample_address();
        assert_eq!(
            address.socket_addr(),
            "203.0.113.9:38333".parse::<SocketAddr>().unwrap()
        );

        roundtrip(NetworkMessage::Addr(vec![TimestampedAddress {
            time: 1_600_000_000,
            address,
        }]));
    }

    #[test]
    fn getheaders_roundtrip() {
        roundtrip(NetworkMessage::GetHeaders(BlockLocator {
            have: vec![Hash::new([5; 32]), Hash::new([6; 32])],
            stop: Hash::ZERO,
        }));
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(matches!(
            NetworkMessage::from_wire("filterload", &[]),
            Err(NetworkError::UnknownCommand(_))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut payload = NetworkMessage::Ping(1).payload();
        payload.push(0xff);

        assert!(NetworkMessage::from_wire("ping", &payload).is_err());
    }
}
