use std::{fmt, io, ops::Deref, str::FromStr};

use xds_codec::{Decode, Encode};

/// Content identifier of `BYTES` length, stored in wire order.
///
/// XDS follows the Bitcoin convention: hashes travel little-endian on
/// the wire but are displayed (and numerically compared) big-endian,
/// so `Display`/`FromStr` reverse the stored bytes and `Ord` compares
/// from the most significant end.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash<const BYTES: usize>([u8; BYTES]);

impl<const BYTES: usize> Hash<BYTES> {
    pub const ZERO: Self = Self([0; BYTES]);

    #[inline]
    pub const fn new(bytes: [u8; BYTES]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; BYTES]
    }

    /// Bytes in big-endian (display) order.
    pub fn to_be_bytes(self) -> [u8; BYTES] {
        let mut out = self.0;
        out.reverse();
        out
    }
}

impl<const BYTES: usize> Default for Hash<BYTES> {
    fn default() -> Self {
        Self::ZERO
    }
}

impl<const BYTES: usize> From<[u8; BYTES]> for Hash<BYTES> {
    #[inline]
    fn from(bytes: [u8; BYTES]) -> Self {
        Self::new(bytes)
    }
}

impl<const BYTES: usize> AsRef<[u8]> for Hash<BYTES> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const BYTES: usize> Deref for Hash<BYTES> {
    type Target = [u8; BYTES];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const BYTES: usize> Ord for Hash<BYTES> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // numeric comparison: most significant byte is stored last
        self.0.iter().rev().cmp(other.0.iter().rev())
    }
}

impl<const BYTES: usize> PartialOrd for Hash<BYTES> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<const BYTES: usize> fmt::Debug for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(&format!("Hash<{size}>", size = BYTES))
            .field(&hex::encode(self.to_be_bytes()))
            .finish()
    }
}

impl<const BYTES: usize> fmt::Display for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_be_bytes()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseHashError {
    #[error("invalid hex in hash literal")]
    BadHex(#[from] hex::FromHexError),
}

impl<const BYTES: usize> FromStr for Hash<BYTES> {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; BYTES];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Self::new(bytes))
    }
}

impl<const BYTES: usize> Encode for Hash<BYTES> {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), xds_codec::Error> {
        self.0.encode(w)
    }
}

impl<const BYTES: usize> Decode for Hash<BYTES> {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, xds_codec::Error> {
        Ok(Self::new(<[u8; BYTES]>::decode(r)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xds_codec::Fragment;

    #[test]
    fn display_reverses_wire_order() {
        let mut bytes = [0u8; 32];
        bytes[31] = 0xab;
        let digest = Hash::<32>::new(bytes);

        assert!(digest.to_string().starts_with("ab"));
        assert_eq!(digest.to_string().parse::<Hash<32>>().unwrap(), digest);
    }

    #[test]
    fn ordering_is_big_endian_numeric() {
        let mut low = [0u8; 32];
        low[0] = 0xff; // low-order byte
        let mut high = [0u8; 32];
        high[31] = 0x01; // high-order byte

        assert!(Hash::<32>::new(low) < Hash::<32>::new(high));
    }

    #[test]
    fn codec_roundtrip() {
        let digest: Hash<32> = "0000000e13c5bf36c155c7cb1681053d607c191fc44b863d0c5aef6d27b8eb8f"
            .parse()
            .unwrap();

        let bytes = digest.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(Hash::<32>::from_bytes(&bytes).unwrap(), digest);
    }

    #[test]
    fn from_str_rejects_wrong_length() {
        assert!("27".parse::<Hash<32>>().is_err());
    }
}
