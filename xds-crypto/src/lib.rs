//! Cryptographic primitives for the XDS chain.
//!
//! The node core consumes a small, fixed contract: 32-byte content
//! hashes (`hash256`, `sha512_trunc256`) and ECDSA signature
//! verification. Everything here wraps well-known implementations;
//! no primitive is hand-rolled.

pub mod ecdsa;
pub mod hash;

pub use hash::{Hash, Hasher};
