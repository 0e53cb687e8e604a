//! Proven headers: a PoS header bundled with its coinstake and a
//! merkle path, enough to judge stake eligibility without the body.

use std::io;

use xds_codec::{decode_list, encode_list, Decode, Encode, Error, VarInt};
use xds_crypto::Hash;

use crate::{block::BlockHeader, merkle, transaction::Transaction};

/// Inclusion proof for one transaction, bottom-up sibling hashes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MerklePath {
    pub leaf_index: u32,
    pub hashes: Vec<Hash<32>>,
}

impl MerklePath {
    /// Fold `leaf` up the path and compare against `root`.
    pub fn proves(&self, leaf: Hash<32>, root: &Hash<32>) -> bool {
        merkle::branch_root(leaf, &self.hashes, self.leaf_index as usize) == *root
    }
}

impl Encode for MerklePath {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        VarInt(u64::from(self.leaf_index)).encode(w)?;
        encode_list(&self.hashes, w)
    }
}

impl Decode for MerklePath {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let leaf_index = VarInt::decode(r)?.0;
        let leaf_index = u32::try_from(leaf_index)
            .map_err(|_| Error::InvalidValue("merkle path leaf index"))?;

        Ok(Self {
            leaf_index,
            hashes: decode_list(r)?,
        })
    }
}

/// Header variant advertised by upgraded peers: the coinstake and its
/// merkle path ride along so stake eligibility is checkable while the
/// body is still in flight.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProvenHeader {
    pub header: BlockHeader,
    pub coinstake: Transaction,
    pub merkle_path: MerklePath,
    /// Block signature by the staking key.
    pub signature: Vec<u8>,
}

impl ProvenHeader {
    pub fn hash(&self) -> Hash<32> {
        self.header.hash()
    }

    /// `true` when the embedded coinstake is bound to the header's
    /// merkle root by the carried path.
    pub fn coinstake_is_included(&self) -> bool {
        self.merkle_path
            .proves(self.coinstake.txid(), &self.header.merkle_root)
    }
}

impl Encode for ProvenHeader {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        self.header.encode(w)?;
        self.coinstake.encode(w)?;
        self.merkle_path.encode(w)?;
        self.signature.encode(w)
    }
}

impl Decode for ProvenHeader {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            header: BlockHeader::decode(r)?,
            coinstake: Transaction::decode(r)?,
            merkle_path: MerklePath::decode(r)?,
            signature: Vec::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, TxInput, TxOutput};
    use crate::CompactTarget;
    use xds_codec::Fragment;

    fn coinstake() -> Transaction {
        Transaction {
            version: 1,
            time: 1_578_008_160,
            inputs: vec![TxInput::spending(OutPoint::new(Hash::new([9; 32]), 1))],
            outputs: vec![
                TxOutput::new(0, Vec::new()),
                TxOutput::new(10 * crate::COIN, vec![0x00, 0x14, 0xcc]),
            ],
            locktime: 0,
        }
    }

    fn proven() -> ProvenHeader {
        let coinbase_txid = Hash::new([3; 32]);
        let stake = coinstake();
        let leaves = [coinbase_txid, stake.txid()];

        let header = BlockHeader {
            version: 1,
            prev_hash: Hash::new([1; 32]),
            merkle_root: merkle::merkle_root(&leaves),
            time: 1_578_008_320,
            bits: CompactTarget(0x1e0f_ffff),
            nonce: 0,
        };

        ProvenHeader {
            header,
            coinstake: stake,
            merkle_path: MerklePath {
                leaf_index: 1,
                hashes: merkle::merkle_branch(&leaves, 1),
            },
            signature: vec![0x30, 0x45],
        }
    }

    #[test]
    fn roundtrip() {
        let ph = proven();
        assert_eq!(ProvenHeader::from_bytes(&ph.to_bytes()).unwrap(), ph);
    }

    #[test]
    fn valid_path_proves_inclusion() {
        assert!(proven().coinstake_is_included());
    }

    #[test]
    fn tampered_coinstake_fails_proof() {
        let mut ph = proven();
        ph.coinstake.outputs[1].value += 1;
        assert!(!ph.coinstake_is_included());
    }
}
