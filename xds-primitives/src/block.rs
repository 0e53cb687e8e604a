//! Block header and block, with the sha512-truncated header hash the
//! chain uses for both identity and proof of work.

use std::io;

use xds_codec::{decode_list, encode_list, Decode, Encode, Error};
use xds_crypto::{Hash, Hasher};

use crate::{merkle, target, transaction::Transaction, CompactTarget};

/// 80-byte header. The PoS block signature is block data and never
/// enters the header hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash<32>,
    pub merkle_root: Hash<32>,
    pub time: u32,
    pub bits: CompactTarget,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SERIALIZED_SIZE: usize = 80;

    /// Block identity and proof-of-work hash:
    /// `sha512_trunc256(serialize(header))`.
    pub fn hash(&self) -> Hash<32> {
        Hasher::sha512_trunc256(&self.to_bytes())
    }

    /// `true` when the header hash satisfies its own `bits` field.
    pub fn meets_own_target(&self) -> bool {
        target::hash_meets_target(&self.hash(), self.bits)
    }
}

impl Encode for BlockHeader {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        self.version.encode(w)?;
        self.prev_hash.encode(w)?;
        self.merkle_root.encode(w)?;
        self.time.encode(w)?;
        self.bits.0.encode(w)?;
        self.nonce.encode(w)
    }
}

impl Decode for BlockHeader {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            version: i32::decode(r)?,
            prev_hash: Hash::decode(r)?,
            merkle_root: Hash::decode(r)?,
            time: u32::decode(r)?,
            bits: CompactTarget(u32::decode(r)?),
            nonce: u32::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// ECDSA signature by the staking key; empty on PoW blocks.
    pub signature: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> Hash<32> {
        self.header.hash()
    }

    /// A PoS block carries its coinstake as the second transaction.
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn coinstake(&self) -> Option<&Transaction> {
        self.transactions.get(1).filter(|tx| tx.is_coinstake())
    }

    pub fn txids(&self) -> Vec<Hash<32>> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Recompute the merkle root over the block's transactions.
    pub fn compute_merkle_root(&self) -> (Hash<32>, bool) {
        merkle::merkle_root_with_mutation(&self.txids())
    }

    pub fn total_size(&self) -> usize {
        self.encoded_size()
    }

    /// Block weight: sum of transaction weights plus four times the
    /// framing bytes (header, counts, signature).
    pub fn weight(&self) -> usize {
        let tx_weight: usize = self.transactions.iter().map(Transaction::weight).sum();
        let tx_total: usize = self.transactions.iter().map(Transaction::total_size).sum();
        let framing = self.total_size() - tx_total;

        framing * 4 + tx_weight
    }
}

impl Encode for Block {
    fn encode<W: io::Write>(&self, w: &mut W) -> Result<(), Error> {
        self.header.encode(w)?;
        encode_list(&self.transactions, w)?;
        self.signature.encode(w)
    }
}

impl Decode for Block {
    fn decode<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            header: BlockHeader::decode(r)?,
            transactions: decode_list(r)?,
            signature: Vec::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, TxInput, TxOutput};
    use xds_codec::Fragment;

    pub(crate) fn reference_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash::ZERO,
            merkle_root: Hash::new([0x11; 32]),
            time: 1_578_008_160,
            bits: CompactTarget(0x1e0f_ffff),
            nonce: 15_118_976,
        }
    }

    fn coinbase(height_tag: u8) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput {
                prevout: OutPoint::NULL,
                script_sig: vec![height_tag],
                sequence: u32::MAX,
                witness: Vec::new(),
            }],
            outputs: vec![TxOutput::new(50 * crate::COIN, vec![0x00, 0x14, 0xaa])],
            locktime: 0,
        }
    }

    #[test]
    fn header_serializes_to_80_bytes() {
        let header = reference_header();
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), BlockHeader::SERIALIZED_SIZE);
        assert_eq!(
            hex::encode(&bytes),
            "01000000000000000000000000000000000000000000000000000000000000000000\
             00001111111111111111111111111111111111111111111111111111111111111111\
             607e0e5effff0f1e80b2e600"
        );
        assert_eq!(BlockHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn header_hash_is_sha512_trunc256_of_serialization() {
        let header = reference_header();

        // fixture: sha512(serialize(header))[..32]
        assert_eq!(
            hex::encode(*header.hash()),
            "01c3771c859c7c496693516141b69c58b2d7f43097757761f42caa3541e492c2"
        );
        assert_eq!(
            header.hash(),
            Hasher::sha512_trunc256(&header.to_bytes())
        );
    }

    #[test]
    fn block_roundtrip() {
        let block = Block {
            header: reference_header(),
            transactions: vec![coinbase(1), coinbase(2)],
            signature: vec![0x30, 0x44, 0x02, 0x20],
        };

        let bytes = block.to_bytes();
        assert_eq!(Block::from_bytes(&bytes).unwrap(), block);
    }

    #[test]
    fn merkle_root_covers_all_transactions() {
        let block = Block {
            header: reference_header(),
            transactions: vec![coinbase(1), coinbase(2), coinbase(3)],
            signature: Vec::new(),
        };

        let (root, mutated) = block.compute_merkle_root();
        assert!(!mutated);
        assert_eq!(root, merkle::merkle_root(&block.txids()));
    }

    proptest::proptest! {
        #[test]
        fn header_codec_roundtrips(
            version in proptest::num::i32::ANY,
            prev in proptest::array::uniform32(proptest::num::u8::ANY),
            merkle in proptest::array::uniform32(proptest::num::u8::ANY),
            time in proptest::num::u32::ANY,
            bits in proptest::num::u32::ANY,
            nonce in proptest::num::u32::ANY,
        ) {
            let header = BlockHeader {
                version,
                prev_hash: Hash::new(prev),
                merkle_root: Hash::new(merkle),
                time,
                bits: CompactTarget(bits),
                nonce,
            };

            let bytes = header.to_bytes();
            proptest::prop_assert_eq!(bytes.len(), BlockHeader::SERIALIZED_SIZE);
            proptest::prop_assert_eq!(BlockHeader::from_bytes(&bytes).unwrap(), header);
        }
    }

    #[test]
    fn pow_block_is_not_pos() {
        let block = Block {
            header: reference_header(),
            transactions: vec![coinbase(1)],
            signature: Vec::new(),
        };

        assert!(!block.is_proof_of_stake());
        assert!(block.coinstake().is_none());
    }
}
