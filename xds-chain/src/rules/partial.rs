//! Partial-validation pipeline: stateless transaction checks run off
//! the hot path, with header-chain context but no coinview.

use std::collections::HashSet;

use xds_addresses::ScriptClass;
use xds_primitives::{money_range, Transaction};

use crate::error::ConsensusError;

use super::{PartialContext, PartialRule};

/// Locktimes below this are heights, at or above are timestamps.
const LOCKTIME_THRESHOLD: u32 = 500_000_000;

pub struct CoinbasePlacementRule;

impl PartialRule for CoinbasePlacementRule {
    fn name(&self) -> &'static str {
        "CoinbasePlacementRule"
    }

    fn check(&self, ctx: &PartialContext) -> Result<(), ConsensusError> {
        let txs = &ctx.block.transactions;

        if txs.first().map(Transaction::is_coinbase) != Some(true) {
            return Err(ConsensusError::BadCoinbasePlacement);
        }

        if txs.iter().skip(1).any(Transaction::is_coinbase) {
            return Err(ConsensusError::BadCoinbasePlacement);
        }

        Ok(())
    }
}

/// PoS blocks carry exactly one coinstake in slot one plus a block
/// signature; PoW blocks carry neither.
pub struct CoinstakePlacementRule;

impl PartialRule for CoinstakePlacementRule {
    fn name(&self) -> &'static str {
        "CoinstakePlacementRule"
    }

    fn check(&self, ctx: &PartialContext) -> Result<(), ConsensusError> {
        let txs = &ctx.block.transactions;

        if ctx.block.is_proof_of_stake() {
            if txs.iter().skip(2).any(Transaction::is_coinstake) {
                return Err(ConsensusError::BadCoinstakePlacement);
            }

            if ctx.block.signature.is_empty() {
                return Err(ConsensusError::BadBlockSignature);
            }

            // coinbase of a PoS block pays nothing; the reward rides
            // on the coinstake
            if txs[0].total_output_value() != 0 {
                return Err(ConsensusError::BadCoinstakePlacement);
            }
        } else {
            if txs.iter().any(Transaction::is_coinstake) {
                return Err(ConsensusError::BadCoinstakePlacement);
            }

            if !ctx.block.signature.is_empty() {
                return Err(ConsensusError::BadBlockSignature);
            }
        }

        Ok(())
    }
}

pub struct TxStructureRule;

impl PartialRule for TxStructureRule {
    fn name(&self) -> &'static str {
        "TxStructureRule"
    }

    fn check(&self, ctx: &PartialContext) -> Result<(), ConsensusError> {
        let mut seen_outpoints = HashSet::new();

        for tx in &ctx.block.transactions {
            if tx.inputs.is_empty() || tx.outputs.is_empty() {
                return Err(ConsensusError::BadTransaction);
            }

            let mut total: i64 = 0;
            for output in &tx.outputs {
                if !money_range(output.value) {
                    return Err(ConsensusError::BadAmount);
                }
                total = total
                    .checked_add(output.value)
                    .ok_or(ConsensusError::BadAmount)?;
            }
            if !money_range(total) {
                return Err(ConsensusError::BadAmount);
            }

            for input in &tx.inputs {
                if input.prevout.is_null() {
                    if !tx.is_coinbase() {
                        return Err(ConsensusError::BadTransaction);
                    }
                    continue;
                }

                // one spend per outpoint across the whole block
                if !seen_outpoints.insert(input.prevout) {
                    return Err(ConsensusError::DuplicateInput);
                }
            }
        }

        Ok(())
    }
}

/// Every non-coinbase input must carry witness data.
pub struct WitnessPresentRule;

impl PartialRule for WitnessPresentRule {
    fn name(&self) -> &'static str {
        "WitnessPresentRule"
    }

    fn check(&self, ctx: &PartialContext) -> Result<(), ConsensusError> {
        for tx in ctx.block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            if tx.inputs.iter().any(|input| input.witness.is_empty()) {
                return Err(ConsensusError::MissingWitness);
            }
        }

        Ok(())
    }
}

/// Signature material lives in the witness, never in scriptSig.
pub struct ScriptSigEmptyRule;

impl PartialRule for ScriptSigEmptyRule {
    fn name(&self) -> &'static str {
        "ScriptSigEmptyRule"
    }

    fn check(&self, ctx: &PartialContext) -> Result<(), ConsensusError> {
        for tx in ctx.block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            if tx.inputs.iter().any(|input| !input.script_sig.is_empty()) {
                return Err(ConsensusError::ScriptSigNotEmpty);
            }
        }

        Ok(())
    }
}

/// Outputs are restricted to the whitelisted witness templates.
/// Coinbase may additionally carry empty and commitment outputs;
/// a coinstake's first output is the canonical empty marker.
pub struct OutputWhitelistRule;

impl OutputWhitelistRule {
    fn coinbase_output_allowed(script: &[u8]) -> bool {
        match ScriptClass::of(script) {
            ScriptClass::P2wpkh(_) | ScriptClass::P2wsh(_) | ScriptClass::Empty => true,
            // OP_RETURN payloads (witness commitment and the like)
            ScriptClass::Unknown => script.first() == Some(&0x6a),
        }
    }
}

impl PartialRule for OutputWhitelistRule {
    fn name(&self) -> &'static str {
        "OutputWhitelistRule"
    }

    fn check(&self, ctx: &PartialContext) -> Result<(), ConsensusError> {
        for (index, tx) in ctx.block.transactions.iter().enumerate() {
            let is_coinstake = index == 1 && tx.is_coinstake();

            if tx.is_coinbase() {
                if !tx
                    .outputs
                    .iter()
                    .all(|o| Self::coinbase_output_allowed(&o.script_pubkey))
                {
                    return Err(ConsensusError::OutputNotWhitelisted);
                }
                continue;
            }

            for (vout, output) in tx.outputs.iter().enumerate() {
                if is_coinstake && vout == 0 {
                    // the empty marker was already shape-checked
                    continue;
                }

                if !ScriptClass::of(&output.script_pubkey).is_whitelisted() {
                    return Err(ConsensusError::OutputNotWhitelisted);
                }
            }
        }

        Ok(())
    }
}

pub struct SigOpCountRule;

impl SigOpCountRule {
    /// Conservative sigop accounting: one per input, plus explicit
    /// CHECKSIG-class opcodes in output scripts.
    fn block_sigops(ctx: &PartialContext) -> usize {
        ctx.block
            .transactions
            .iter()
            .map(|tx| {
                let input_ops = tx.inputs.len();
                let output_ops: usize = tx
                    .outputs
                    .iter()
                    .map(|o| {
                        o.script_pubkey
                            .iter()
                            .filter(|b| **b == 0xac || **b == 0xae)
                            .count()
                    })
                    .sum();
                input_ops + output_ops
            })
            .sum()
    }
}

impl PartialRule for SigOpCountRule {
    fn name(&self) -> &'static str {
        "SigOpCountRule"
    }

    fn check(&self, ctx: &PartialContext) -> Result<(), ConsensusError> {
        if Self::block_sigops(ctx) > ctx.params.max_block_sigops {
            return Err(ConsensusError::BadSigOpCount);
        }

        Ok(())
    }
}

/// Transactions must be final at the block's height and time.
pub struct LockTimeRule;

impl LockTimeRule {
    fn is_final(tx: &Transaction, height: u64, block_time: u32) -> bool {
        if tx.locktime == 0 {
            return true;
        }

        let cutoff = if tx.locktime < LOCKTIME_THRESHOLD {
            height
        } else {
            u64::from(block_time)
        };

        if u64::from(tx.locktime) < cutoff {
            return true;
        }

        // a fully-sequenced transaction opts out of locktime
        tx.inputs.iter().all(|input| input.sequence == u32::MAX)
    }
}

impl PartialRule for LockTimeRule {
    fn name(&self) -> &'static str {
        "LockTimeRule"
    }

    fn check(&self, ctx: &PartialContext) -> Result<(), ConsensusError> {
        for tx in &ctx.block.transactions {
            if !Self::is_final(tx, ctx.height, ctx.block.header.time) {
                return Err(ConsensusError::NonFinalTransaction);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleEngine;
    use xds_crypto::Hash;
    use xds_primitives::{
        Block, BlockHeader, CompactTarget, NetworkParams, OutPoint, TxInput, TxOutput, COIN,
    };

    fn coinbase(value: i64) -> Transaction {
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&[0x01; 20]);

        Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput {
                prevout: OutPoint::NULL,
                script_sig: vec![0x01],
                sequence: u32::MAX,
                witness: Vec::new(),
            }],
            outputs: vec![TxOutput::new(value, script)],
            locktime: 0,
        }
    }

    fn spend(tag: u8) -> Transaction {
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&[tag; 20]);

        Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput {
                prevout: OutPoint::new(Hash::new([tag; 32]), 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
                witness: vec![vec![0x30], vec![0x02]],
            }],
            outputs: vec![TxOutput::new(COIN, script)],
            locktime: 0,
        }
    }

    fn block_of(transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash::ZERO,
                merkle_root: Hash::ZERO,
                time: 1_578_008_176,
                bits: CompactTarget(0x1e0f_ffff),
                nonce: 0,
            },
            transactions,
            signature: Vec::new(),
        }
    }

    fn validate(block: &Block) -> Result<(), ConsensusError> {
        let params = NetworkParams::mainnet();
        RuleEngine::standard().validate_partial(&PartialContext {
            params: &params,
            block,
            height: 10,
        })
    }

    #[test]
    fn honest_pow_block_passes() {
        let block = block_of(vec![coinbase(50 * COIN), spend(2)]);
        assert!(validate(&block).is_ok());
    }

    #[test]
    fn missing_coinbase_rejected() {
        let block = block_of(vec![spend(2)]);
        assert_eq!(validate(&block), Err(ConsensusError::BadCoinbasePlacement));
    }

    #[test]
    fn second_coinbase_rejected() {
        let block = block_of(vec![coinbase(1), coinbase(2)]);
        assert_eq!(validate(&block), Err(ConsensusError::BadCoinbasePlacement));
    }

    #[test]
    fn duplicate_outpoint_across_block_rejected() {
        let block = block_of(vec![coinbase(1), spend(2), spend(2)]);
        assert_eq!(validate(&block), Err(ConsensusError::DuplicateInput));
    }

    #[test]
    fn missing_witness_rejected() {
        let mut tx = spend(2);
        tx.inputs[0].witness.clear();

        let block = block_of(vec![coinbase(1), tx]);
        assert_eq!(validate(&block), Err(ConsensusError::MissingWitness));
    }

    #[test]
    fn nonempty_script_sig_rejected() {
        let mut tx = spend(2);
        tx.inputs[0].script_sig = vec![0x51];

        let block = block_of(vec![coinbase(1), tx]);
        assert_eq!(validate(&block), Err(ConsensusError::ScriptSigNotEmpty));
    }

    #[test]
    fn p2pkh_output_rejected_p2wpkh_accepted() {
        // OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
        let mut legacy_script = vec![0x76, 0xa9, 0x14];
        legacy_script.extend_from_slice(&[0x07; 20]);
        legacy_script.extend_from_slice(&[0x88, 0xac]);

        let mut legacy = spend(2);
        legacy.outputs[0].script_pubkey = legacy_script;

        let block = block_of(vec![coinbase(1), legacy]);
        assert_eq!(validate(&block), Err(ConsensusError::OutputNotWhitelisted));

        // same value to a P2WPKH program clears the rule
        let block = block_of(vec![coinbase(1), spend(2)]);
        assert!(validate(&block).is_ok());
    }

    #[test]
    fn pos_block_shape_enforced() {
        let mut coinstake = spend(3);
        coinstake.outputs.insert(0, TxOutput::new(0, Vec::new()));

        // missing block signature
        let block = block_of(vec![coinbase(0), coinstake.clone(), spend(4)]);
        assert_eq!(validate(&block), Err(ConsensusError::BadBlockSignature));

        let mut signed = block_of(vec![coinbase(0), coinstake.clone(), spend(4)]);
        signed.signature = vec![0x30, 0x44];
        assert!(validate(&signed).is_ok());

        // a paying coinbase contradicts the coinstake reward
        let mut paying = block_of(vec![coinbase(COIN), coinstake, spend(4)]);
        paying.signature = vec![0x30, 0x44];
        assert_eq!(
            validate(&paying),
            Err(ConsensusError::BadCoinstakePlacement)
        );
    }

    #[test]
    fn pow_block_must_not_carry_signature() {
        let mut block = block_of(vec![coinbase(1), spend(2)]);
        block.signature = vec![0x30];
        assert_eq!(validate(&block), Err(ConsensusError::BadBlockSignature));
    }

    #[test]
    fn locktime_gates_finality() {
        let mut tx = spend(2);
        tx.locktime = 11; // height-based, not yet final at height 10
        tx.inputs[0].sequence = 0;

        let block = block_of(vec![coinbase(1), tx]);
        assert_eq!(validate(&block), Err(ConsensusError::NonFinalTransaction));

        let mut tx = spend(2);
        tx.locktime = 9;
        tx.inputs[0].sequence = 0;

        let block = block_of(vec![coinbase(1), tx]);
        assert!(validate(&block).is_ok());
    }
}
