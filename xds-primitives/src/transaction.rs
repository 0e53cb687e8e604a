//! Transaction model and its canonical serialization.
//!
//! XDS transactions carry a `time` stamp inherited from the PoS side
//! of the chain; it serializes directly after `version` on every
//! transaction. Witness data follows the BIP-144 layout: when any
//! input has a witness, a `0x00 0x01` marker sits between `version`
//! (+`time`) and the input list, and witness stacks trail the outputs.

use std::io;

use xds_codec::{decode_list, encode_list, Decode, Encode, Error, VarInt};
use xds_crypto::{Hash, Hasher};

use crate::Amount;

/// Reference to an output of a previous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct OutPoint {
    pub txid: Hash<32>,
    pub vout: u32,
}

impl OutPoint {
    /// Marker prevout used by coinbase inputs.
    pub const NULL: Self = Self {
        txid: Hash::ZERO,
        vout: u32::MAX,
    };

    pub fn new(txid: Hash<32>, vout: u32) -> Self {
        Self { txid, vout }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl Encode for OutPoint {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        self.txid.encode(w)?;
        self.vout.encode(w)
    }
}

impl Decode for OutPoint {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            txid: Hash::decode(r)?,
            vout: u32::decode(r)?,
        })
    }
}

/// Witness stack of one input.
pub type Witness = Vec<Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxInput {
    pub prevout: OutPoint,
    /// Consensus requires this empty on every non-coinbase input.
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Witness stack; not part of the txid.
    pub witness: Witness,
}

impl TxInput {
    pub fn spending(prevout: OutPoint) -> Self {
        Self {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
            witness: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxOutput {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// The canonical empty output: first output of a coinstake.
    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encode for TxOutput {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        self.value.encode(w)?;
        self.script_pubkey.encode(w)
    }
}

impl Decode for TxOutput {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            value: Amount::decode(r)?,
            script_pubkey: Vec::decode(r)?,
        })
    }
}

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub version: i32,
    /// PoS timestamp, serialized right after `version`.
    pub time: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl Transaction {
    /// Identifier over the witness-stripped serialization.
    pub fn txid(&self) -> Hash<32> {
        let mut out = Vec::with_capacity(self.base_size());
        self.encode_inner(&mut out, false)
            .expect("encoding to a vec is infallible");
        Hasher::hash256(&out)
    }

    /// Identifier over the full serialization, witnesses included.
    pub fn wtxid(&self) -> Hash<32> {
        Hasher::hash256(&self.to_bytes())
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// A coinstake spends a real input into an empty-first-output
    /// shape with at least two outputs.
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].prevout.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    pub fn total_output_value(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Serialized size without witness data.
    pub fn base_size(&self) -> usize {
        let mut counter = Vec::new();
        self.encode_inner(&mut counter, false)
            .expect("encoding to a vec is infallible");
        counter.len()
    }

    /// Full serialized size.
    pub fn total_size(&self) -> usize {
        self.encoded_size()
    }

    /// Weight per BIP-141: stripped size counts four times.
    pub fn weight(&self) -> usize {
        self.base_size() * 3 + self.total_size()
    }

    /// Virtual size used for fee rates, rounded up.
    pub fn vsize(&self) -> usize {
        (self.weight() + 3) / 4
    }

    fn encode_inner<W: io::Write>(&self, w: &mut W, with_witness: bool) -> Result<(), Error> {
        let with_witness = with_witness && self.has_witness();

        self.version.encode(w)?;
        self.time.encode(w)?;

        if with_witness {
            SEGWIT_MARKER.encode(w)?;
            SEGWIT_FLAG.encode(w)?;
        }

        VarInt(self.inputs.len() as u64).encode(w)?;
        for input in &self.inputs {
            input.prevout.encode(w)?;
            input.script_sig.encode(w)?;
            input.sequence.encode(w)?;
        }

        encode_list(&self.outputs, w)?;

        if with_witness {
            for input in &self.inputs {
                encode_list(&input.witness, w)?;
            }
        }

        self.locktime.encode(w)
    }
}

impl Encode for Transaction {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        self.encode_inner(w, true)
    }
}

impl Decode for Transaction {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let version = i32::decode(r)?;
        let time = u32::decode(r)?;

        let mut input_count = VarInt::decode(r)?.0;
        let mut segwit = false;

        // an empty input list is impossible, so a zero count is the
        // segwit marker and the flag byte must follow
        if input_count == 0 {
            if u8::decode(r)? != SEGWIT_FLAG {
                return Err(Error::InvalidValue("segwit flag"));
            }
            segwit = true;
            input_count = VarInt::decode(r)?.0;
        }

        let input_count = xds_codec::checked_len(input_count)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));

        for _ in 0..input_count {
            inputs.push(TxInput {
                prevout: OutPoint::decode(r)?,
                script_sig: Vec::decode(r)?,
                sequence: u32::decode(r)?,
                witness: Vec::new(),
            });
        }

        let outputs = decode_list(r)?;

        if segwit {
            for input in inputs.iter_mut() {
                input.witness = decode_list(r)?;
            }
        }

        let locktime = u32::decode(r)?;

        let tx = Self {
            version,
            time,
            inputs,
            outputs,
            locktime,
        };

        // a marker without any witness would re-encode differently
        if segwit && !tx.has_witness() {
            return Err(Error::InvalidValue("segwit marker without witness"));
        }

        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xds_codec::Fragment;

    fn dummy_outpoint(tag: u8) -> OutPoint {
        OutPoint::new(Hash::new([tag; 32]), 0)
    }

    pub(crate) fn legacy_tx() -> Transaction {
        Transaction {
            version: 1,
            time: 1_578_008_160,
            inputs: vec![TxInput::spending(dummy_outpoint(7))],
            outputs: vec![TxOutput::new(50 * crate::COIN, vec![0x00, 0x14, 0xaa])],
            locktime: 0,
        }
    }

    pub(crate) fn witness_tx() -> Transaction {
        let mut tx = legacy_tx();
        tx.inputs[0].witness = vec![vec![0x30, 0x45], vec![0x02, 0x21]];
        tx
    }

    #[test]
    fn roundtrip_without_witness() {
        let tx = legacy_tx();
        let bytes = tx.to_bytes();
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);
    }

    #[test]
    fn roundtrip_with_witness() {
        let tx = witness_tx();
        let bytes = tx.to_bytes();
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);
    }

    #[test]
    fn txid_ignores_witness() {
        assert_eq!(legacy_tx().txid(), witness_tx().txid());
        assert_ne!(witness_tx().txid(), witness_tx().wtxid());
    }

    #[test]
    fn wtxid_equals_txid_without_witness() {
        let tx = legacy_tx();
        assert_eq!(tx.txid(), tx.wtxid());
    }

    #[test]
    fn coinbase_and_coinstake_classification() {
        let mut coinbase = legacy_tx();
        coinbase.inputs[0].prevout = OutPoint::NULL;
        assert!(coinbase.is_coinbase());
        assert!(!coinbase.is_coinstake());

        let coinstake = Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput::spending(dummy_outpoint(9))],
            outputs: vec![
                TxOutput::new(0, Vec::new()),
                TxOutput::new(10 * crate::COIN, vec![0x00, 0x14, 0xbb]),
            ],
            locktime: 0,
        };
        assert!(coinstake.is_coinstake());
        assert!(!coinstake.is_coinbase());
    }

    #[test]
    fn weight_counts_witness_once() {
        let tx = witness_tx();
        assert_eq!(tx.weight(), tx.base_size() * 3 + tx.total_size());
        assert!(tx.vsize() < tx.total_size());
        assert!(tx.vsize() > tx.base_size() / 2);
    }

    #[test]
    fn marker_without_witness_rejected() {
        let mut bytes = Vec::new();
        1i32.encode(&mut bytes).unwrap();
        0u32.encode(&mut bytes).unwrap();
        // marker + flag, then an inputless, witnessless body
        bytes.extend_from_slice(&[0x00, 0x01, 0x00]);
        // outputs
        bytes.push(0x00);
        // locktime
        0u32.encode(&mut bytes).unwrap();

        assert!(Transaction::from_bytes(&bytes).is_err());
    }
}
