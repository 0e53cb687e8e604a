use cryptoxide::digest::Digest as _;
use cryptoxide::sha2::{Sha256, Sha512};

use crate::hash::Hash;

/// Streaming hasher over the two digest constructions XDS uses.
///
/// `hash256` is double SHA-256 and identifies transactions, blocks and
/// message payloads. `sha512_trunc256` (the first 32 bytes of a
/// SHA-512 digest) is the header proof-of-work hash.
///
/// ```
/// use xds_crypto::Hasher;
///
/// let mut hasher = Hasher::new();
/// hasher.input(b"xds");
/// let digest = hasher.finalize();
/// # assert_eq!(
/// #   "ac41b756523ac6259b105b1b9ac96569960aede3869acd7d65efdc04d37495bc",
/// #   digest.to_string(),
/// # );
/// ```
pub struct Hasher(Sha256);

impl Hasher {
    /// Fresh double SHA-256 hasher.
    #[inline]
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    #[inline]
    pub fn input(&mut self, bytes: &[u8]) {
        self.0.input(bytes);
    }

    /// Consume the hasher and produce `sha256(sha256(input))`.
    pub fn finalize(mut self) -> Hash<32> {
        let mut first = [0u8; 32];
        self.0.result(&mut first);

        let mut second = Sha256::new();
        second.input(&first);

        let mut out = [0u8; 32];
        second.result(&mut out);
        Hash::new(out)
    }

    /// One-shot `hash256` of the given bytes.
    #[inline]
    pub fn hash256(bytes: &[u8]) -> Hash<32> {
        let mut hasher = Self::new();
        hasher.input(bytes);
        hasher.finalize()
    }

    /// One-shot single SHA-256, used for witness-script commitments.
    pub fn sha256(bytes: &[u8]) -> Hash<32> {
        let mut sha = Sha256::new();
        sha.input(bytes);

        let mut out = [0u8; 32];
        sha.result(&mut out);
        Hash::new(out)
    }

    /// One-shot SHA-512 truncated to its first 32 bytes.
    pub fn sha512_trunc256(bytes: &[u8]) -> Hash<32> {
        let mut sha = Sha512::new();
        sha.input(bytes);

        let mut full = [0u8; 64];
        sha.result(&mut full);

        let mut out = [0u8; 32];
        out.copy_from_slice(&full[..32]);
        Hash::new(out)
    }

    /// `ripemd160(sha256(input))`, the witness-program key hash.
    pub fn hash160(bytes: &[u8]) -> Hash<20> {
        use ripemd::{Digest as _, Ripemd160};

        let mut sha = Sha256::new();
        sha.input(bytes);
        let mut first = [0u8; 32];
        sha.result(&mut first);

        let digest = Ripemd160::digest(first);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        Hash::new(out)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash256_known_vectors() {
        assert_eq!(
            hex::encode(*Hasher::hash256(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456",
        );
        assert_eq!(
            hex::encode(*Hasher::hash256(b"xds")),
            "bc9574d304dcef657dcd9a86e3ed0a966965c99a1b5b109b25c63a5256b741ac",
        );
    }

    #[test]
    fn sha512_trunc256_known_vectors() {
        assert_eq!(
            hex::encode(*Hasher::sha512_trunc256(b"")),
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce",
        );
        assert_eq!(
            hex::encode(*Hasher::sha512_trunc256(b"xds")),
            "7435a1e81fb328cc8d7a8530f029265a0ae9bd77655761e153b08835a8364ee6",
        );
    }

    #[test]
    fn hash160_known_vector() {
        assert_eq!(
            hex::encode(*Hasher::hash160(b"xds")),
            "2bd14545e8c99d4660a05f597c8aa9d2b779b3bd",
        );
    }

    #[test]
    fn streaming_matches_oneshot() {
        let mut hasher = Hasher::new();
        hasher.input(b"x");
        hasher.input(b"ds");

        assert_eq!(hasher.finalize(), Hasher::hash256(b"xds"));
    }
}
