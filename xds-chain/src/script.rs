//! Witness verification for the whitelisted output templates.
//!
//! The chain only ever creates P2WPKH and P2WSH outputs, so the
//! script machine is correspondingly small: BIP-143 style signature
//! digests, key-hash binding for P2WPKH, and the single-key script
//! form (`<pubkey> OP_CHECKSIG`) for P2WSH.

use xds_codec::Encode;
use xds_crypto::{ecdsa, Hash, Hasher};
use xds_primitives::{Amount, Transaction, TxOutput};

use crate::error::ConsensusError;
use xds_addresses::ScriptClass;

const OP_CHECKSIG: u8 = 0xac;

/// Sighash flag covering all inputs and outputs; the only flag the
/// chain's templates use.
const SIGHASH_ALL: u32 = 1;

fn hash_prevouts(tx: &Transaction) -> Hash<32> {
    let mut buf = Vec::with_capacity(tx.inputs.len() * 36);
    for input in &tx.inputs {
        input
            .prevout
            .encode(&mut buf)
            .expect("encoding to a vec is infallible");
    }
    Hasher::hash256(&buf)
}

fn hash_sequences(tx: &Transaction) -> Hash<32> {
    let mut buf = Vec::with_capacity(tx.inputs.len() * 4);
    for input in &tx.inputs {
        input
            .sequence
            .encode(&mut buf)
            .expect("encoding to a vec is infallible");
    }
    Hasher::hash256(&buf)
}

fn hash_outputs(tx: &Transaction) -> Hash<32> {
    let mut buf = Vec::new();
    for output in &tx.outputs {
        output
            .encode(&mut buf)
            .expect("encoding to a vec is infallible");
    }
    Hasher::hash256(&buf)
}

/// Segwit signature digest for one input.
///
/// `script_code` is the P2PKH shape for P2WPKH spends and the witness
/// script for P2WSH spends; `amount` commits to the spent value.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Amount,
) -> Hash<32> {
    let input = &tx.inputs[input_index];

    let mut buf = Vec::new();
    tx.version
        .encode(&mut buf)
        .expect("encoding to a vec is infallible");
    tx.time
        .encode(&mut buf)
        .expect("encoding to a vec is infallible");
    buf.extend_from_slice(hash_prevouts(tx).as_ref());
    buf.extend_from_slice(hash_sequences(tx).as_ref());
    input
        .prevout
        .encode(&mut buf)
        .expect("encoding to a vec is infallible");
    script_code
        .to_vec()
        .encode(&mut buf)
        .expect("encoding to a vec is infallible");
    amount
        .encode(&mut buf)
        .expect("encoding to a vec is infallible");
    input
        .sequence
        .encode(&mut buf)
        .expect("encoding to a vec is infallible");
    buf.extend_from_slice(hash_outputs(tx).as_ref());
    tx.locktime
        .encode(&mut buf)
        .expect("encoding to a vec is infallible");
    SIGHASH_ALL
        .encode(&mut buf)
        .expect("encoding to a vec is infallible");

    Hasher::hash256(&buf)
}

/// The implicit script code of a P2WPKH spend.
fn p2wpkh_script_code(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(key_hash);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn split_signature(raw: &[u8]) -> Result<&[u8], ConsensusError> {
    // DER body plus a trailing sighash byte, which must be ALL
    match raw.split_last() {
        Some((&flag, der)) if u32::from(flag) == SIGHASH_ALL && !der.is_empty() => Ok(der),
        _ => Err(ConsensusError::BadScript),
    }
}

fn verify_p2wpkh(
    tx: &Transaction,
    input_index: usize,
    amount: Amount,
    key_hash: &[u8; 20],
) -> Result<(), ConsensusError> {
    let witness = &tx.inputs[input_index].witness;

    let [signature, pubkey] = witness.as_slice() else {
        return Err(ConsensusError::BadScript);
    };

    if *Hasher::hash160(pubkey) != *key_hash {
        return Err(ConsensusError::BadScript);
    }

    let digest = signature_hash(tx, input_index, &p2wpkh_script_code(key_hash), amount);
    let der = split_signature(signature)?;

    if !ecdsa::verify_ecdsa(digest, der, pubkey) {
        return Err(ConsensusError::BadScript);
    }

    Ok(())
}

fn verify_p2wsh(
    tx: &Transaction,
    input_index: usize,
    amount: Amount,
    script_hash: &[u8; 32],
) -> Result<(), ConsensusError> {
    let witness = &tx.inputs[input_index].witness;

    // last element is the witness script, preceded by its stack
    let Some((script, stack)) = witness.split_last() else {
        return Err(ConsensusError::BadScript);
    };

    if *Hasher::sha256(script) != *script_hash {
        return Err(ConsensusError::BadScript);
    }

    // supported script form: <33-byte pubkey push> OP_CHECKSIG
    match script.as_slice() {
        [0x21, pubkey @ .., op] if pubkey.len() == 33 && *op == OP_CHECKSIG => {
            let [signature] = stack else {
                return Err(ConsensusError::BadScript);
            };

            let digest = signature_hash(tx, input_index, script, amount);
            let der = split_signature(signature)?;

            if !ecdsa::verify_ecdsa(digest, der, pubkey) {
                return Err(ConsensusError::BadScript);
            }

            Ok(())
        }
        _ => Err(ConsensusError::BadScript),
    }
}

/// Verify one input's witness against the output it spends.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    spent: &TxOutput,
) -> Result<(), ConsensusError> {
    match ScriptClass::of(&spent.script_pubkey) {
        ScriptClass::P2wpkh(key_hash) => {
            verify_p2wpkh(tx, input_index, spent.value, &key_hash)
        }
        ScriptClass::P2wsh(script_hash) => {
            verify_p2wsh(tx, input_index, spent.value, &script_hash)
        }
        _ => Err(ConsensusError::BadScript),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Message, Secp256k1, SecretKey};
    use xds_primitives::{OutPoint, TxInput};

    struct Signer {
        secp: Secp256k1<secp256k1::All>,
        sk: SecretKey,
        pubkey: Vec<u8>,
    }

    impl Signer {
        fn new(seed: u8) -> Self {
            let secp = Secp256k1::new();
            let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
            let pubkey = sk.public_key(&secp).serialize().to_vec();
            Self { secp, sk, pubkey }
        }

        fn key_hash(&self) -> [u8; 20] {
            *Hasher::hash160(&self.pubkey)
        }

        fn sign(&self, digest: Hash<32>) -> Vec<u8> {
            let msg = Message::from_digest(*digest);
            let mut sig = self.secp.sign_ecdsa(&msg, &self.sk).serialize_der().to_vec();
            sig.push(SIGHASH_ALL as u8);
            sig
        }
    }

    fn spending_tx(signer: &Signer) -> (Transaction, TxOutput) {
        let spent = TxOutput::new(5_000_000, {
            let mut script = vec![0x00, 0x14];
            script.extend_from_slice(&signer.key_hash());
            script
        });

        let tx = Transaction {
            version: 1,
            time: 100,
            inputs: vec![TxInput::spending(OutPoint::new(Hash::new([8; 32]), 0))],
            outputs: vec![TxOutput::new(4_000_000, vec![0x00, 0x14, 0x01])],
            locktime: 0,
        };

        (tx, spent)
    }

    #[test]
    fn p2wpkh_spend_verifies() {
        let signer = Signer::new(0x11);
        let (mut tx, spent) = spending_tx(&signer);

        let digest = signature_hash(
            &tx,
            0,
            &p2wpkh_script_code(&signer.key_hash()),
            spent.value,
        );
        tx.inputs[0].witness = vec![signer.sign(digest), signer.pubkey.clone()];

        assert!(verify_input(&tx, 0, &spent).is_ok());
    }

    #[test]
    fn tampered_output_breaks_signature() {
        let signer = Signer::new(0x11);
        let (mut tx, spent) = spending_tx(&signer);

        let digest = signature_hash(
            &tx,
            0,
            &p2wpkh_script_code(&signer.key_hash()),
            spent.value,
        );
        tx.inputs[0].witness = vec![signer.sign(digest), signer.pubkey.clone()];

        tx.outputs[0].value -= 1;
        assert_eq!(verify_input(&tx, 0, &spent), Err(ConsensusError::BadScript));
    }

    #[test]
    fn wrong_pubkey_fails_key_hash_binding() {
        let signer = Signer::new(0x11);
        let intruder = Signer::new(0x22);
        let (mut tx, spent) = spending_tx(&signer);

        let digest = signature_hash(
            &tx,
            0,
            &p2wpkh_script_code(&signer.key_hash()),
            spent.value,
        );
        tx.inputs[0].witness = vec![intruder.sign(digest), intruder.pubkey.clone()];

        assert_eq!(verify_input(&tx, 0, &spent), Err(ConsensusError::BadScript));
    }

    #[test]
    fn p2wsh_single_key_spend_verifies() {
        let signer = Signer::new(0x33);

        let mut witness_script = vec![0x21];
        witness_script.extend_from_slice(&signer.pubkey);
        witness_script.push(OP_CHECKSIG);

        let spent = TxOutput::new(7_000_000, {
            let mut script = vec![0x00, 0x20];
            script.extend_from_slice(Hasher::sha256(&witness_script).as_ref());
            script
        });

        let mut tx = Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput::spending(OutPoint::new(Hash::new([9; 32]), 1))],
            outputs: vec![TxOutput::new(6_000_000, vec![0x00, 0x14, 0x02])],
            locktime: 0,
        };

        let digest = signature_hash(&tx, 0, &witness_script, spent.value);
        tx.inputs[0].witness = vec![signer.sign(digest), witness_script];

        assert!(verify_input(&tx, 0, &spent).is_ok());
    }

    #[test]
    fn missing_witness_is_bad_script() {
        let signer = Signer::new(0x11);
        let (tx, spent) = spending_tx(&signer);

        assert_eq!(verify_input(&tx, 0, &spent), Err(ConsensusError::BadScript));
    }
}
