//! Per-block stake metadata and kernel eligibility.

use std::collections::HashMap;
use std::sync::Mutex;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tracing::trace;
use xds_codec::Encode;
use xds_crypto::{Hash, Hasher};
use xds_primitives::{target, CompactTarget, NetworkParams, OutPoint};
use xds_storage::{DbHash, DbSerde, KvStore, KvTable, SharedKv, WriteBatch};

use crate::error::{ChainError, ConsensusError};

/// Stake metadata recorded for every accepted block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStake {
    /// Modifier mixed into the next block's kernel.
    pub stake_modifier: Hash<32>,
    /// Kernel hash of a PoS block, or the block hash for PoW.
    pub hash_proof: Hash<32>,
    /// Coinstake time; zero on PoW blocks.
    pub stake_time: u32,
    /// Staking input; the null outpoint on PoW blocks.
    pub prev_out: OutPoint,
}

impl BlockStake {
    /// Metadata of a PoW block: no kernel, the block hash stands in
    /// as proof.
    pub fn for_pow(block_hash: Hash<32>, prev_modifier: Hash<32>) -> Self {
        Self {
            stake_modifier: next_stake_modifier(&block_hash, &prev_modifier),
            hash_proof: block_hash,
            stake_time: 0,
            prev_out: OutPoint::NULL,
        }
    }

    pub fn for_pos(
        kernel_hash: Hash<32>,
        prev_modifier: Hash<32>,
        stake_time: u32,
        prev_out: OutPoint,
    ) -> Self {
        Self {
            stake_modifier: next_stake_modifier(&kernel_hash, &prev_modifier),
            hash_proof: kernel_hash,
            stake_time,
            prev_out,
        }
    }
}

/// `hash256(proof || prev_modifier)`, chaining the modifier so every
/// block perturbs future kernels.
pub fn next_stake_modifier(proof: &Hash<32>, prev_modifier: &Hash<32>) -> Hash<32> {
    let mut hasher = Hasher::new();
    hasher.input(proof.as_ref());
    hasher.input(prev_modifier.as_ref());
    hasher.finalize()
}

struct StakeTable;

impl KvTable for StakeTable {
    const NAME: &'static str = "stake";
    type Key = DbHash;
    type Value = DbSerde<BlockStake>;
}

/// KV table the stake chain expects.
pub const STAKE_TABLES: &[&str] = &[StakeTable::NAME];

/// Stake metadata per block hash, persisted with a small read cache.
pub struct StakeChain {
    kv: SharedKv,
    cache: Mutex<HashMap<Hash<32>, BlockStake>>,
}

impl StakeChain {
    pub fn new(kv: SharedKv) -> Self {
        Self {
            kv,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, block_hash: &Hash<32>) -> Result<Option<BlockStake>, ChainError> {
        if let Some(hit) = self
            .cache
            .lock()
            .expect("lock is never poisoned")
            .get(block_hash)
        {
            return Ok(Some(hit.clone()));
        }

        let stake =
            StakeTable::get(self.kv.as_ref(), DbHash(**block_hash))?.map(|DbSerde(s)| s);

        if let Some(stake) = &stake {
            self.cache
                .lock()
                .expect("lock is never poisoned")
                .insert(*block_hash, stake.clone());
        }

        Ok(stake)
    }

    pub fn put(&self, block_hash: Hash<32>, stake: BlockStake) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        StakeTable::stage_put(&mut batch, DbHash(*block_hash), DbSerde(stake.clone()))?;
        self.kv.commit(batch)?;

        self.cache
            .lock()
            .expect("lock is never poisoned")
            .insert(block_hash, stake);

        Ok(())
    }

    pub fn remove(&self, block_hash: &Hash<32>) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        StakeTable::stage_delete(&mut batch, DbHash(**block_hash));
        self.kv.commit(batch)?;

        self.cache
            .lock()
            .expect("lock is never poisoned")
            .remove(block_hash);

        Ok(())
    }
}

/// Everything a kernel check needs from chain context.
#[derive(Debug, Clone)]
pub struct KernelInput {
    pub stake_modifier: Hash<32>,
    /// Timestamp of the block holding the staked output.
    pub prev_block_time: u32,
    pub prev_out: OutPoint,
    /// Value of the staked output in satoshi.
    pub staked_value: i64,
    /// Coinstake timestamp, equals the block timestamp.
    pub stake_time: u32,
    pub bits: CompactTarget,
}

/// Stateless kernel-eligibility checks, parameterized by network.
pub struct StakeValidator {
    params: NetworkParams,
}

impl StakeValidator {
    pub fn new(params: NetworkParams) -> Self {
        Self { params }
    }

    /// Kernel hash:
    /// `hash256(modifier || prev_block_time || prev_txid || vout || stake_time)`.
    pub fn kernel_hash(input: &KernelInput) -> Hash<32> {
        let mut payload = Vec::with_capacity(32 + 4 + 32 + 4 + 4);
        payload.extend_from_slice(input.stake_modifier.as_ref());
        input
            .prev_block_time
            .encode(&mut payload)
            .expect("encoding to a vec is infallible");
        payload.extend_from_slice(input.prev_out.txid.as_ref());
        input
            .prev_out
            .vout
            .encode(&mut payload)
            .expect("encoding to a vec is infallible");
        input
            .stake_time
            .encode(&mut payload)
            .expect("encoding to a vec is infallible");

        Hasher::hash256(&payload)
    }

    /// Full eligibility check: time granularity, then the kernel hash
    /// against the value-weighted target.
    pub fn check_kernel(&self, input: &KernelInput) -> Result<Hash<32>, ConsensusError> {
        if input.stake_time & self.params.stake_timestamp_mask != 0 {
            return Err(ConsensusError::BadStakeTime);
        }

        if input.staked_value <= 0 {
            return Err(ConsensusError::BadAmount);
        }

        let target = input
            .bits
            .to_target()
            .ok_or(ConsensusError::BadDiffBits)?;

        // kernel / value <= target, rearranged to avoid division
        let weighted = target * BigUint::from(input.staked_value as u64);
        let kernel = Self::kernel_hash(input);

        if target::hash_to_uint(&kernel) > weighted {
            trace!(%kernel, "kernel missed the weighted target");
            return Err(ConsensusError::BadStakeKernel);
        }

        Ok(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use xds_storage::MemoryKv;

    fn kernel_input(stake_time: u32, value: i64, bits: u32) -> KernelInput {
        KernelInput {
            stake_modifier: Hash::new([5; 32]),
            prev_block_time: 1_578_008_160,
            prev_out: OutPoint::new(Hash::new([6; 32]), 1),
            staked_value: value,
            stake_time,
            bits: CompactTarget(bits),
        }
    }

    fn validator() -> StakeValidator {
        StakeValidator::new(NetworkParams::mainnet())
    }

    #[test]
    fn kernel_hash_matches_fixture() {
        let input = kernel_input(1_578_008_320, 1, 0x1e0f_ffff);

        // hash256(modifier || prev_time || prev_txid || vout || stake_time)
        assert_eq!(
            hex::encode(*StakeValidator::kernel_hash(&input)),
            "56c4af09631ee8894a9ce21ffec8fd82007cb2c964b6447d9c3a395edd094c1f"
        );

        let mut other = input.clone();
        other.prev_out.vout += 1;
        assert_ne!(
            StakeValidator::kernel_hash(&input),
            StakeValidator::kernel_hash(&other)
        );
    }

    #[test]
    fn misaligned_stake_time_rejected() {
        // low nibble set violates the 16-second mask
        let input = kernel_input(1_578_008_321, 1_000, 0x1e0f_ffff);

        assert_eq!(
            validator().check_kernel(&input),
            Err(ConsensusError::BadStakeTime)
        );
    }

    #[test]
    fn stake_weight_decides_eligibility() {
        // the fixture kernel sits 128_193x above the unweighted
        // mainnet limit target, so weight decides the outcome
        let bits = 0x1e0f_ffff;

        let tiny = kernel_input(1_578_008_320, 1_000, bits);
        assert_eq!(
            validator().check_kernel(&tiny),
            Err(ConsensusError::BadStakeKernel)
        );

        let huge = kernel_input(1_578_008_320, 1_000_000, bits);
        assert!(validator().check_kernel(&huge).is_ok());
    }

    #[test]
    fn modifier_chains_forward() {
        let genesis_modifier = Hash::ZERO;
        let pow = BlockStake::for_pow(Hash::new([1; 32]), genesis_modifier);

        assert_eq!(pow.prev_out, OutPoint::NULL);
        assert_eq!(
            pow.stake_modifier,
            next_stake_modifier(&Hash::new([1; 32]), &genesis_modifier)
        );

        let pos = BlockStake::for_pos(
            Hash::new([2; 32]),
            pow.stake_modifier,
            1_578_008_320,
            OutPoint::new(Hash::new([3; 32]), 0),
        );
        assert_ne!(pos.stake_modifier, pow.stake_modifier);
    }

    #[test]
    fn stake_chain_roundtrip() {
        let kv: SharedKv = Arc::new(MemoryKv::new(STAKE_TABLES));
        let chain = StakeChain::new(kv);

        let hash = Hash::new([9; 32]);
        let stake = BlockStake::for_pow(hash, Hash::ZERO);

        assert!(chain.get(&hash).unwrap().is_none());
        chain.put(hash, stake.clone()).unwrap();
        assert_eq!(chain.get(&hash).unwrap(), Some(stake));

        chain.remove(&hash).unwrap();
        assert!(chain.get(&hash).unwrap().is_none());
    }
}
