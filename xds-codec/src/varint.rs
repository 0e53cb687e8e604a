//! Variable-length integer used for all length prefixes.

use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Decode, Encode, Error};

/// Bitcoin-style compact size: one byte below 0xFD, otherwise a
/// 0xFD/0xFE/0xFF marker followed by a 2/4/8 byte little-endian value.
///
/// Decoding is canonical: a value that would have fit a shorter form
/// is rejected, so every integer has exactly one encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VarInt(pub u64);

impl From<u64> for VarInt {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<usize> for VarInt {
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl VarInt {
    /// Size of the encoded form in bytes.
    pub fn size(&self) -> usize {
        match self.0 {
            0..=0xFC => 1,
            0xFD..=0xFFFF => 3,
            0x10000..=0xFFFF_FFFF => 5,
            _ => 9,
        }
    }
}

impl Encode for VarInt {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        match self.0 {
            0..=0xFC => w.write_u8(self.0 as u8)?,
            0xFD..=0xFFFF => {
                w.write_u8(0xFD)?;
                w.write_u16::<LittleEndian>(self.0 as u16)?;
            }
            0x10000..=0xFFFF_FFFF => {
                w.write_u8(0xFE)?;
                w.write_u32::<LittleEndian>(self.0 as u32)?;
            }
            _ => {
                w.write_u8(0xFF)?;
                w.write_u64::<LittleEndian>(self.0)?;
            }
        }

        Ok(())
    }
}

impl Decode for VarInt {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let marker = r.read_u8()?;

        let value = match marker {
            0xFD => {
                let v = r.read_u16::<LittleEndian>()? as u64;
                if v < 0xFD {
                    return Err(Error::NonCanonicalVarInt);
                }
                v
            }
            0xFE => {
                let v = r.read_u32::<LittleEndian>()? as u64;
                if v <= 0xFFFF {
                    return Err(Error::NonCanonicalVarInt);
                }
                v
            }
            0xFF => {
                let v = r.read_u64::<LittleEndian>()?;
                if v <= 0xFFFF_FFFF {
                    return Err(Error::NonCanonicalVarInt);
                }
                v
            }
            small => small as u64,
        };

        Ok(Self(value))
    }
}
