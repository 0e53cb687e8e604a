//! Integrity pipeline rules, run on block arrival before queueing.

use crate::error::ConsensusError;

use super::{IntegrityContext, IntegrityRule};

pub struct MerkleRootRule;

impl IntegrityRule for MerkleRootRule {
    fn name(&self) -> &'static str {
        "MerkleRootRule"
    }

    fn check(&self, ctx: &IntegrityContext) -> Result<(), ConsensusError> {
        let (root, mutated) = ctx.block.compute_merkle_root();

        if mutated {
            return Err(ConsensusError::BadMerkleMutation);
        }

        if root != ctx.block.header.merkle_root {
            return Err(ConsensusError::BadMerkleRoot);
        }

        Ok(())
    }
}

pub struct BlockSizeRule;

impl IntegrityRule for BlockSizeRule {
    fn name(&self) -> &'static str {
        "BlockSizeRule"
    }

    fn check(&self, ctx: &IntegrityContext) -> Result<(), ConsensusError> {
        if ctx.block.transactions.is_empty() {
            return Err(ConsensusError::BadBlockLength);
        }

        let base: usize = ctx
            .block
            .transactions
            .iter()
            .map(|tx| tx.base_size())
            .sum();

        if base > ctx.params.max_block_base_size
            || ctx.block.weight() > ctx.params.max_block_weight
        {
            return Err(ConsensusError::BadBlockLength);
        }

        Ok(())
    }
}

/// Prefix of the coinbase output committing to witness data.
const WITNESS_COMMITMENT_PREFIX: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

pub struct WitnessCommitmentRule;

impl IntegrityRule for WitnessCommitmentRule {
    fn name(&self) -> &'static str {
        "WitnessCommitmentRule"
    }

    fn check(&self, ctx: &IntegrityContext) -> Result<(), ConsensusError> {
        let any_witness = ctx
            .block
            .transactions
            .iter()
            .any(|tx| tx.has_witness());

        if !any_witness {
            return Ok(());
        }

        let coinbase = ctx
            .block
            .transactions
            .first()
            .ok_or(ConsensusError::BadBlockLength)?;

        let committed = coinbase.outputs.iter().any(|output| {
            output.script_pubkey.len() >= 38
                && output.script_pubkey[..6] == WITNESS_COMMITMENT_PREFIX
        });

        if !committed {
            return Err(ConsensusError::BadWitnessCommitment);
        }

        Ok(())
    }
}
