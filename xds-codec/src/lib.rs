//! Canonical binary encoding shared across all XDS crates.
//!
//! The wire format is deterministic and round-trips exactly:
//! `encode(decode(bytes)) == bytes` for every well-formed input.
//! Integers are little-endian, collections are length-prefixed with a
//! [`VarInt`], and decoders reject non-minimal varints and oversized
//! length prefixes.

use std::io;

pub use byteorder;

pub mod varint;

pub use varint::VarInt;

/// Hard cap on any single length-prefixed allocation.
///
/// Matches the maximum network payload size, so no well-formed message
/// can carry a collection larger than this.
pub const MAX_ALLOC: u64 = 0x0200_0000;

/// Elements reserved up-front when decoding a collection. Growth past
/// this point must be earned by actual decoded data.
const PREALLOC_CAP: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error during encode/decode")]
    Io(#[from] io::Error),

    #[error("varint is not minimally encoded")]
    NonCanonicalVarInt,

    #[error("length prefix {requested} exceeds allocation bound {max}")]
    AllocationBound { requested: u64, max: u64 },

    #[error("invalid value for field {0}")]
    InvalidValue(&'static str),

    #[error("{0} trailing bytes after decoded value")]
    TrailingBytes(usize),
}

/// A value with a canonical wire encoding.
pub trait Encode {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error>;

    /// Encode into a fresh byte vector.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out)
            .expect("encoding to a vec is infallible");
        out
    }

    /// Serialized size in bytes.
    fn encoded_size(&self) -> usize {
        let mut counter = CountingSink::default();
        self.encode(&mut counter)
            .expect("encoding to a counter is infallible");
        counter.0
    }
}

/// A value decodable from its canonical wire encoding.
pub trait Decode: Sized {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error>;

    /// Decode a value that must consume the whole input.
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = io::Cursor::new(bytes);
        let value = Self::decode(&mut cursor)?;
        let leftover = bytes.len() - cursor.position() as usize;

        if leftover > 0 {
            return Err(Error::TrailingBytes(leftover));
        }

        Ok(value)
    }
}

/// Round-trip capable wire value, the bound used across the workspace.
pub trait Fragment: Encode + Decode {}

impl<T> Fragment for T where T: Encode + Decode {}

#[derive(Default)]
struct CountingSink(usize);

impl io::Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Checks a length prefix against [`MAX_ALLOC`] before any allocation.
pub fn checked_len(requested: u64) -> Result<usize, Error> {
    if requested > MAX_ALLOC {
        return Err(Error::AllocationBound {
            requested,
            max: MAX_ALLOC,
        });
    }

    Ok(requested as usize)
}

macro_rules! int_codec {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Encode for $ty {
            fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
                use byteorder::{LittleEndian, WriteBytesExt};
                w.$write::<LittleEndian>(*self)?;
                Ok(())
            }
        }

        impl Decode for $ty {
            fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
                use byteorder::{LittleEndian, ReadBytesExt};
                Ok(r.$read::<LittleEndian>()?)
            }
        }
    };
}

int_codec!(u16, write_u16, read_u16);
int_codec!(u32, write_u32, read_u32);
int_codec!(u64, write_u64, read_u64);
int_codec!(i32, write_i32, read_i32);
int_codec!(i64, write_i64, read_i64);

impl Encode for u8 {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(&[*self])?;
        Ok(())
    }
}

impl Decode for u8 {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let mut buf = [0u8; 1];
        r.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

impl Encode for bool {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        (*self as u8).encode(w)
    }
}

impl Decode for bool {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        match u8::decode(r)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidValue("bool")),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(self)?;
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let mut buf = [0u8; N];
        r.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Byte strings carry a varint length prefix.
impl Encode for Vec<u8> {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        VarInt(self.len() as u64).encode(w)?;
        w.write_all(self)?;
        Ok(())
    }
}

impl Decode for Vec<u8> {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let len = checked_len(VarInt::decode(r)?.0)?;
        let mut buf = vec![0u8; len.min(PREALLOC_CAP)];
        let mut filled = 0;

        while filled < len {
            if filled == buf.len() {
                buf.resize((buf.len() * 2).min(len), 0);
            }
            let n = r.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }

        buf.truncate(len);
        Ok(buf)
    }
}

/// Generic collections: varint count followed by each element.
pub fn encode_list<T: Encode, W: io::Write>(items: &[T], w: &mut W) -> Result<(), Error> {
    VarInt(items.len() as u64).encode(w)?;

    for item in items {
        item.encode(w)?;
    }

    Ok(())
}

pub fn decode_list<T: Decode, R: io::Read>(r: &mut R) -> Result<Vec<T>, Error> {
    let len = checked_len(VarInt::decode(r)?.0)?;
    let mut items = Vec::with_capacity(len.min(PREALLOC_CAP));

    for _ in 0..len {
        items.push(T::decode(r)?);
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Fragment + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = value.to_bytes();
        let back = T::from_bytes(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn integers_roundtrip_little_endian() {
        roundtrip(0x1234u16);
        roundtrip(0xdeadbeefu32);
        roundtrip(u64::MAX);
        roundtrip(-1i32);

        assert_eq!(0xdeadbeefu32.to_bytes(), vec![0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn byte_string_roundtrip() {
        roundtrip(Vec::from(&b"xds"[..]));
        roundtrip(Vec::<u8>::new());
    }

    #[test]
    fn bool_rejects_junk() {
        assert!(matches!(
            bool::from_bytes(&[2]),
            Err(Error::InvalidValue("bool"))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        assert!(matches!(
            u16::from_bytes(&[1, 0, 9]),
            Err(Error::TrailingBytes(1))
        ));
    }

    #[test]
    fn oversized_prefix_rejected() {
        // claims 2^32 bytes follow
        let mut bytes = vec![0xfe];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());

        assert!(matches!(
            Vec::<u8>::from_bytes(&bytes),
            Err(Error::AllocationBound { .. })
        ));
    }

    #[test]
    fn encoded_size_matches_bytes() {
        let value = Vec::from(&b"0123456789"[..]);
        assert_eq!(value.encoded_size(), value.to_bytes().len());
    }
}
