//! ECDSA verification over secp256k1.
//!
//! Script witnesses carry DER-encoded signatures followed by a
//! one-byte sighash type; the message is always a 32-byte digest.

use once_cell::sync::Lazy;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};

use crate::hash::Hash;

static SECP: Lazy<Secp256k1<VerifyOnly>> = Lazy::new(Secp256k1::verification_only);

/// Verify a DER signature (without the trailing sighash byte) over a
/// 32-byte message digest. Malformed keys or signatures verify false.
pub fn verify_ecdsa(msg: Hash<32>, sig_der: &[u8], pubkey: &[u8]) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };

    let Ok(mut sig) = Signature::from_der(sig_der) else {
        return false;
    };

    // high-S signatures are non-standard but must still verify
    sig.normalize_s();

    let msg = Message::from_digest(*msg);

    SECP.verify_ecdsa(&msg, &sig, &pubkey).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hasher;

    #[test]
    fn garbage_inputs_verify_false() {
        let digest = Hasher::hash256(b"message");

        assert!(!verify_ecdsa(digest, &[0x30, 0x06], &[0x02; 33]));
        assert!(!verify_ecdsa(digest, &[], &[]));
    }

    #[test]
    fn valid_signature_verifies() {
        use secp256k1::{Secp256k1, SecretKey};

        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pk = sk.public_key(&secp);

        let digest = Hasher::hash256(b"signed payload");
        let msg = Message::from_digest(*digest);
        let sig = secp.sign_ecdsa(msg, &sk);

        assert!(verify_ecdsa(
            digest,
            &sig.serialize_der(),
            &pk.serialize()
        ));

        let other = Hasher::hash256(b"tampered payload");
        assert!(!verify_ecdsa(other, &sig.serialize_der(), &pk.serialize()));
    }
}
