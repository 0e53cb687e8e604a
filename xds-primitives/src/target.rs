//! Compact difficulty encoding and 256-bit target arithmetic.

use num_bigint::BigUint;
use num_traits::One;

use xds_crypto::Hash;

/// Difficulty target in the compact `nBits` form: one exponent byte
/// followed by a three-byte mantissa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CompactTarget(pub u32);

impl CompactTarget {
    /// Expand to the full 256-bit target.
    ///
    /// Returns `None` for encodings that overflow 256 bits or carry
    /// the sign bit, both of which are invalid in a header.
    pub fn to_target(self) -> Option<BigUint> {
        let bits = self.0;
        let exponent = (bits >> 24) as usize;
        let mantissa = bits & 0x007f_ffff;

        if bits & 0x0080_0000 != 0 {
            return None;
        }

        let target = if exponent <= 3 {
            BigUint::from(mantissa >> (8 * (3 - exponent)))
        } else {
            if exponent > 32 {
                return None;
            }
            BigUint::from(mantissa) << (8 * (exponent - 3))
        };

        if target.bits() > 256 {
            return None;
        }

        Some(target)
    }

    /// Compress a 256-bit target back to compact form, truncating the
    /// mantissa the way the reference implementation does.
    pub fn from_target(target: &BigUint) -> Self {
        let bytes = target.to_bytes_be();
        let mut exponent = bytes.len();

        let mut mantissa: u32 = match bytes.len() {
            0 => 0,
            1 => u32::from(bytes[0]) << 16,
            2 => (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8),
            _ => (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]),
        };

        // avoid the sign bit by shifting the mantissa down a byte
        if mantissa & 0x0080_0000 != 0 {
            mantissa >>= 8;
            exponent += 1;
        }

        Self(((exponent as u32) << 24) | mantissa)
    }

    /// Expected work to produce a hash under this target:
    /// `2^256 / (target + 1)`.
    pub fn work(self) -> BigUint {
        match self.to_target() {
            Some(target) => (BigUint::one() << 256u32) / (target + BigUint::one()),
            None => BigUint::from(0u32),
        }
    }
}

/// Interpret a hash as a 256-bit big-endian integer for target
/// comparison.
pub fn hash_to_uint(hash: &Hash<32>) -> BigUint {
    BigUint::from_bytes_le(hash.as_ref())
}

/// `true` when `hash` satisfies the difficulty encoded in `bits`.
pub fn hash_meets_target(hash: &Hash<32>, bits: CompactTarget) -> bool {
    match bits.to_target() {
        Some(target) => hash_to_uint(hash) <= target,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POW_LIMIT_BITS: CompactTarget = CompactTarget(0x1e0f_ffff);

    #[test]
    fn pow_limit_expands_to_expected_prefix() {
        let target = POW_LIMIT_BITS.to_target().unwrap();
        let bytes = target.to_bytes_be();

        // 0x00000fffff000...0 as a 32-byte quantity
        assert_eq!(bytes.len(), 30);
        assert_eq!(&bytes[..3], &[0x0f, 0xff, 0xff]);
        assert!(bytes[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn compact_roundtrip() {
        for bits in [0x1e0f_ffffu32, 0x1d00_ffff, 0x1c0a_e493] {
            let target = CompactTarget(bits).to_target().unwrap();
            assert_eq!(CompactTarget::from_target(&target).0, bits);
        }
    }

    #[test]
    fn negative_and_overflowing_bits_rejected() {
        assert!(CompactTarget(0x1e80_0000).to_target().is_none());
        assert!(CompactTarget(0x2100_ffff).to_target().is_none());
    }

    #[test]
    fn genesis_hash_meets_pow_limit() {
        let genesis: Hash<32> =
            "0000000e13c5bf36c155c7cb1681053d607c191fc44b863d0c5aef6d27b8eb8f"
                .parse()
                .unwrap();

        assert!(hash_meets_target(&genesis, POW_LIMIT_BITS));
    }

    #[test]
    fn work_grows_as_target_shrinks() {
        let easy = CompactTarget(0x1e0f_ffff).work();
        let hard = CompactTarget(0x1c0a_e493).work();
        assert!(hard > easy);
    }
}
