//! Address encoding and the output script templates the chain
//! accepts.
//!
//! XDS outputs are native segwit only: P2WPKH and P2WSH, rendered as
//! bech32 with the `xds` human-readable part. Base58 addresses are
//! still recognized so callers can produce a precise error, but no
//! consensus rule accepts them.

use base58::FromBase58;
use bech32::{FromBase32, ToBase32, Variant};
use thiserror::Error;

/// Witness program sizes for the two accepted templates.
const WPKH_LEN: usize = 20;
const WSH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("error converting from/to bech32 {0}")]
    BadBech32(#[from] bech32::Error),

    #[error("wrong human-readable part {found}, expected {expected}")]
    WrongHrp { expected: String, found: String },

    #[error("unsupported witness version {0}")]
    BadWitnessVersion(u8),

    #[error("witness program has invalid length {0}")]
    BadProgramLength(usize),

    #[error("script does not match a known template")]
    UnknownTemplate,
}

/// Classification of an output script against the chain's templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptClass {
    /// `OP_0 <20-byte key hash>`
    P2wpkh([u8; WPKH_LEN]),
    /// `OP_0 <32-byte script hash>`
    P2wsh([u8; WSH_LEN]),
    /// Zero-length script, only valid inside coinbase/coinstake.
    Empty,
    /// Anything else, including every legacy template.
    Unknown,
}

impl ScriptClass {
    pub fn of(script: &[u8]) -> Self {
        match script {
            [] => Self::Empty,
            [0x00, 0x14, program @ ..] if program.len() == WPKH_LEN => {
                Self::P2wpkh(program.try_into().expect("length checked"))
            }
            [0x00, 0x20, program @ ..] if program.len() == WSH_LEN => {
                Self::P2wsh(program.try_into().expect("length checked"))
            }
            _ => Self::Unknown,
        }
    }

    /// `true` for the templates the output whitelist accepts.
    pub fn is_whitelisted(&self) -> bool {
        matches!(self, Self::P2wpkh(_) | Self::P2wsh(_))
    }
}

/// A spendable address: one of the two whitelisted witness programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    P2wpkh([u8; WPKH_LEN]),
    P2wsh([u8; WSH_LEN]),
}

impl Address {
    /// Parse a bech32 address, checking the network's HRP.
    pub fn from_bech32(hrp: &str, s: &str) -> Result<Self, Error> {
        let (found_hrp, data, variant) = bech32::decode(s)?;

        if found_hrp != hrp {
            return Err(Error::WrongHrp {
                expected: hrp.to_string(),
                found: found_hrp,
            });
        }

        if variant != Variant::Bech32 {
            return Err(Error::BadWitnessVersion(0xFF));
        }

        let (version, program) = data
            .split_first()
            .ok_or(Error::BadProgramLength(0))?;

        if version.to_u8() != 0 {
            return Err(Error::BadWitnessVersion(version.to_u8()));
        }

        let program = Vec::<u8>::from_base32(program)?;

        match program.len() {
            WPKH_LEN => Ok(Self::P2wpkh(program.try_into().expect("length checked"))),
            WSH_LEN => Ok(Self::P2wsh(program.try_into().expect("length checked"))),
            other => Err(Error::BadProgramLength(other)),
        }
    }

    pub fn to_bech32(&self, hrp: &str) -> Result<String, Error> {
        let program: &[u8] = match self {
            Self::P2wpkh(p) => p,
            Self::P2wsh(p) => p,
        };

        let mut data = vec![bech32::u5::try_from_u8(0).expect("0 is a valid u5")];
        data.extend(program.to_base32());

        Ok(bech32::encode(hrp, data, Variant::Bech32)?)
    }

    /// The output script this address locks to.
    pub fn script_pubkey(&self) -> Vec<u8> {
        match self {
            Self::P2wpkh(p) => {
                let mut script = vec![0x00, 0x14];
                script.extend_from_slice(p);
                script
            }
            Self::P2wsh(p) => {
                let mut script = vec![0x00, 0x20];
                script.extend_from_slice(p);
                script
            }
        }
    }

    /// Recover an address from a whitelisted output script.
    pub fn from_script(script: &[u8]) -> Result<Self, Error> {
        match ScriptClass::of(script) {
            ScriptClass::P2wpkh(p) => Ok(Self::P2wpkh(p)),
            ScriptClass::P2wsh(p) => Ok(Self::P2wsh(p)),
            _ => Err(Error::UnknownTemplate),
        }
    }
}

/// `true` when `s` decodes as base58, i.e. a legacy-era address the
/// whitelist will never accept.
pub fn looks_like_legacy_base58(s: &str) -> bool {
    !s.is_empty() && s.from_base58().map(|raw| raw.len() == 25).unwrap_or(false)
}
