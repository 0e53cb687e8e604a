//! Full-validation pipeline: the only rules allowed to consult the
//! coinview. Runs serialized on the chain writer.

use std::collections::HashMap;

use tracing::trace;
use xds_crypto::Hash;
use xds_primitives::{Amount, Block, NetworkParams, TxOutput};

use crate::coinview::{CoinView, CoinViewChanges, UnspentOutputs};
use crate::error::{ChainError, ConsensusError};
use crate::script;
use crate::stake::{KernelInput, StakeValidator};

use super::{FullRule, RuleEngine};

/// One spent output with the context needed by full rules.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub output: TxOutput,
    /// Height the spent output was created at.
    pub height: u64,
    /// Coinbase/coinstake outputs are maturity-gated.
    pub requires_maturity: bool,
    /// Timestamp of the creating transaction (kernel input).
    pub time: u32,
}

/// Everything the full rules see: the block, its chain position, and
/// every input resolved against the coinview.
pub struct FullContext<'a> {
    pub params: &'a NetworkParams,
    pub block: &'a Block,
    pub height: u64,
    /// `resolved[tx_index][input_index]`; empty for the coinbase.
    pub resolved: Vec<Vec<ResolvedInput>>,
    /// Stake modifier of the parent block.
    pub stake_modifier: Hash<32>,
}

impl FullContext<'_> {
    /// Fee of one non-coinbase transaction.
    fn tx_fee(&self, tx_index: usize) -> Result<Amount, ConsensusError> {
        let tx = &self.block.transactions[tx_index];

        let total_in: Amount = self.resolved[tx_index]
            .iter()
            .map(|input| input.output.value)
            .sum();
        let total_out = tx.total_output_value();

        // the coinstake mints its reward, every other transaction
        // must cover its outputs
        if !tx.is_coinstake() && total_out > total_in {
            return Err(ConsensusError::BadAmount);
        }

        Ok(total_in - total_out)
    }

    /// Total fees paid by plain transactions in the block.
    pub fn total_fees(&self) -> Result<Amount, ConsensusError> {
        let mut fees: Amount = 0;

        for (index, tx) in self.block.transactions.iter().enumerate() {
            if tx.is_coinbase() || tx.is_coinstake() {
                continue;
            }

            fees = fees
                .checked_add(self.tx_fee(index)?)
                .ok_or(ConsensusError::BadAmount)?;
        }

        Ok(fees)
    }
}

/// Resolve every input of `block` against the coinview, producing the
/// per-input context and the netted [`CoinViewChanges`].
///
/// Resolution walks transactions in block order over an overlay of
/// the coinview, so intra-block chains resolve and an output both
/// created and spent in the block is netted out of the final delta.
/// A reference to a missing or already-spent output fails with
/// `MissingInput`, which is the input-existence rule.
pub fn resolve_block_inputs(
    block: &Block,
    view: &dyn CoinView,
    height: u64,
) -> Result<(Vec<Vec<ResolvedInput>>, CoinViewChanges), ChainError> {
    // prefetch everything the block references
    let wanted: Vec<Hash<32>> = block
        .transactions
        .iter()
        .flat_map(|tx| tx.inputs.iter())
        .filter(|input| !input.prevout.is_null())
        .map(|input| input.prevout.txid)
        .collect();

    let fetched = view.fetch(&wanted)?;

    // overlay: entries created by this block, mutated as spends land
    let mut created: HashMap<Hash<32>, UnspentOutputs> = HashMap::new();
    let mut created_order: Vec<Hash<32>> = Vec::new();
    // pre-existing entries mutated by this block
    let mut touched: HashMap<Hash<32>, UnspentOutputs> = HashMap::new();
    let mut spends: Vec<(Hash<32>, u32)> = Vec::new();

    let mut resolved = Vec::with_capacity(block.transactions.len());

    for tx in &block.transactions {
        let mut tx_resolved = Vec::with_capacity(tx.inputs.len());

        for input in &tx.inputs {
            if input.prevout.is_null() {
                continue;
            }

            let txid = input.prevout.txid;
            let vout = input.prevout.vout;

            if let Some(entry) = created.get_mut(&txid) {
                // intra-block spend: consume from the overlay, no
                // entry in the spends list
                let output = entry.output(vout).cloned().ok_or(ConsensusError::MissingInput)?;
                tx_resolved.push(ResolvedInput {
                    height: entry.height,
                    requires_maturity: entry.requires_maturity(),
                    time: entry.time,
                    output,
                });
                entry.spend(vout);
                continue;
            }

            let entry = match touched.entry(txid) {
                std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
                std::collections::hash_map::Entry::Vacant(slot) => {
                    let entry = fetched
                        .get(&txid)
                        .cloned()
                        .flatten()
                        .ok_or(ConsensusError::MissingInput)?;
                    slot.insert(entry)
                }
            };

            let output = entry
                .spend(vout)
                .ok_or(ConsensusError::MissingInput)?;

            spends.push((txid, vout));
            tx_resolved.push(ResolvedInput {
                height: entry.height,
                requires_maturity: entry.requires_maturity(),
                time: entry.time,
                output,
            });
        }

        resolved.push(tx_resolved);

        let txid = tx.txid();
        created.insert(txid, UnspentOutputs::from_transaction(tx, height));
        created_order.push(txid);
    }

    let changes = CoinViewChanges {
        spends,
        created: created_order
            .into_iter()
            .filter_map(|txid| {
                let entry = created.remove(&txid)?;
                // fully netted entries never reach the coinview
                (!entry.is_fully_spent()).then_some((txid, entry))
            })
            .collect(),
    };

    trace!(
        spends = changes.spends.len(),
        created = changes.created.len(),
        "resolved block inputs"
    );

    Ok((resolved, changes))
}

/// Coinbase and coinstake outputs ripen before they are spendable.
pub struct MaturityRule;

impl FullRule for MaturityRule {
    fn name(&self) -> &'static str {
        "MaturityRule"
    }

    fn check(&self, ctx: &FullContext) -> Result<(), ConsensusError> {
        for inputs in &ctx.resolved {
            for input in inputs {
                if input.requires_maturity
                    && !ctx.params.is_mature(input.height, ctx.height)
                {
                    return Err(ConsensusError::ImmatureSpend);
                }
            }
        }

        Ok(())
    }
}

/// The block may claim at most subsidy plus fees.
pub struct FeeAndSubsidyRule;

impl FullRule for FeeAndSubsidyRule {
    fn name(&self) -> &'static str {
        "FeeAndSubsidyRule"
    }

    fn check(&self, ctx: &FullContext) -> Result<(), ConsensusError> {
        let budget = ctx
            .params
            .block_subsidy(ctx.height)
            .checked_add(ctx.total_fees()?)
            .ok_or(ConsensusError::BadAmount)?;

        if ctx.block.is_proof_of_stake() {
            let stake_in: Amount = ctx.resolved[1].iter().map(|i| i.output.value).sum();
            let stake_out = ctx.block.transactions[1].total_output_value();
            let reward = stake_out
                .checked_sub(stake_in)
                .ok_or(ConsensusError::BadAmount)?;

            if reward > budget {
                return Err(ConsensusError::BadSubsidy);
            }
        } else {
            let claimed = ctx.block.transactions[0].total_output_value();

            if claimed > budget {
                return Err(ConsensusError::BadSubsidy);
            }
        }

        Ok(())
    }
}

/// Kernel eligibility of the coinstake against the weighted target.
pub struct StakeKernelRule;

impl StakeKernelRule {
    /// Kernel parameters for a PoS block, shared with the executor
    /// that records stake metadata.
    pub fn kernel_input(ctx: &FullContext) -> Option<KernelInput> {
        if !ctx.block.is_proof_of_stake() {
            return None;
        }

        let coinstake = &ctx.block.transactions[1];
        let staked = ctx.resolved.get(1)?.first()?;

        Some(KernelInput {
            stake_modifier: ctx.stake_modifier,
            prev_block_time: staked.time,
            prev_out: coinstake.inputs[0].prevout,
            staked_value: staked.output.value,
            stake_time: coinstake.time,
            bits: ctx.block.header.bits,
        })
    }
}

impl FullRule for StakeKernelRule {
    fn name(&self) -> &'static str {
        "StakeKernelRule"
    }

    fn check(&self, ctx: &FullContext) -> Result<(), ConsensusError> {
        let Some(kernel) = Self::kernel_input(ctx) else {
            return Ok(());
        };

        let validator = StakeValidator::new(ctx.params.clone());
        validator.check_kernel(&kernel)?;

        Ok(())
    }
}

/// The PoS block signature must verify against the staking key.
///
/// The staking key is the public key carried in the coinstake's own
/// witness; the message is the block hash.
pub struct BlockSignatureRule;

impl FullRule for BlockSignatureRule {
    fn name(&self) -> &'static str {
        "BlockSignatureRule"
    }

    fn check(&self, ctx: &FullContext) -> Result<(), ConsensusError> {
        if !ctx.block.is_proof_of_stake() {
            return Ok(());
        }

        let coinstake = &ctx.block.transactions[1];
        let pubkey = coinstake.inputs[0]
            .witness
            .iter()
            .find(|item| item.len() == 33)
            .ok_or(ConsensusError::BadBlockSignature)?;

        let verified = xds_crypto::ecdsa::verify_ecdsa(
            ctx.block.hash(),
            &ctx.block.signature,
            pubkey,
        );

        if !verified {
            return Err(ConsensusError::BadBlockSignature);
        }

        Ok(())
    }
}

/// Witness verification of every resolved input.
pub struct ScriptVerifyRule;

impl FullRule for ScriptVerifyRule {
    fn name(&self) -> &'static str {
        "ScriptVerifyRule"
    }

    fn check(&self, ctx: &FullContext) -> Result<(), ConsensusError> {
        for (tx_index, tx) in ctx.block.transactions.iter().enumerate() {
            if tx.is_coinbase() {
                continue;
            }

            for (input_index, resolved) in ctx.resolved[tx_index].iter().enumerate() {
                script::verify_input(tx, input_index, &resolved.output)?;
            }
        }

        Ok(())
    }
}

/// Outcome of a successful full validation.
pub struct FullOutcome {
    pub changes: CoinViewChanges,
    pub total_fees: Amount,
    /// Kernel parameters of a PoS block, for stake bookkeeping.
    pub kernel: Option<KernelInput>,
}

/// Resolve, run the Full pipeline, and package the outcome.
pub fn run_full_validation(
    engine: &RuleEngine,
    params: &NetworkParams,
    block: &Block,
    view: &dyn CoinView,
    height: u64,
    stake_modifier: Hash<32>,
) -> Result<FullOutcome, ChainError> {
    let (resolved, changes) = resolve_block_inputs(block, view, height)?;

    let ctx = FullContext {
        params,
        block,
        height,
        resolved,
        stake_modifier,
    };

    engine.validate_full(&ctx)?;

    let total_fees = ctx.total_fees()?;
    let kernel = StakeKernelRule::kernel_input(&ctx);

    Ok(FullOutcome {
        changes,
        total_fees,
        kernel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinview::{CachedCoinView, DurableCoinView, COINVIEW_TABLES};
    use std::sync::Arc;
    use xds_crypto::Hasher;
    use xds_primitives::{BlockHeader, CompactTarget, OutPoint, Transaction, TxInput, COIN};
    use xds_storage::{MemoryKv, SharedKv};

    fn view_with(entries: Vec<(Hash<32>, UnspentOutputs)>) -> CachedCoinView {
        let kv: SharedKv = Arc::new(MemoryKv::new(COINVIEW_TABLES));
        let durable = DurableCoinView::open(kv, Hash::ZERO).unwrap();
        let view = CachedCoinView::new(Arc::new(durable)).unwrap();

        view.apply(
            Hash::new([1; 32]),
            Hash::ZERO,
            CoinViewChanges {
                spends: vec![],
                created: entries,
            },
        )
        .unwrap();

        view
    }

    fn wpkh_script(tag: u8) -> Vec<u8> {
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&[tag; 20]);
        script
    }

    fn funding_tx(tag: u8, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput::spending(OutPoint::new(Hash::new([tag; 32]), 0))],
            outputs: vec![TxOutput::new(value, wpkh_script(tag))],
            locktime: 0,
        }
    }

    fn spend_of(source: &Transaction, vout: u32, value: Amount) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput::spending(OutPoint::new(source.txid(), vout))],
            outputs: vec![TxOutput::new(value, wpkh_script(0x99))],
            locktime: 0,
        };
        tx.inputs[0].witness = vec![vec![0x30], vec![0x02; 33]];
        tx
    }

    fn coinbase(value: Amount) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput {
                prevout: OutPoint::NULL,
                script_sig: vec![0x0a],
                sequence: u32::MAX,
                witness: Vec::new(),
            }],
            outputs: vec![TxOutput::new(value, wpkh_script(0x01))],
            locktime: 0,
        }
    }

    fn block_of(transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash::new([1; 32]),
                merkle_root: Hash::ZERO,
                time: 1_578_008_192,
                bits: CompactTarget(0x1e0f_ffff),
                nonce: 0,
            },
            transactions,
            signature: Vec::new(),
        }
    }

    #[test]
    fn resolution_finds_prefetched_outputs() {
        let funding = funding_tx(7, 10 * COIN);
        let entry = UnspentOutputs::from_transaction(&funding, 1);
        let view = view_with(vec![(funding.txid(), entry)]);

        let block = block_of(vec![coinbase(50 * COIN), spend_of(&funding, 0, 9 * COIN)]);
        let (resolved, changes) = resolve_block_inputs(&block, &view, 2).unwrap();

        assert!(resolved[0].is_empty(), "coinbase resolves no inputs");
        assert_eq!(resolved[1][0].output.value, 10 * COIN);
        assert_eq!(changes.spends, vec![(funding.txid(), 0)]);
        assert_eq!(changes.created.len(), 2);
    }

    #[test]
    fn missing_input_fails_resolution() {
        let view = view_with(vec![]);
        let ghost = funding_tx(9, COIN);

        let block = block_of(vec![coinbase(50 * COIN), spend_of(&ghost, 0, COIN / 2)]);
        let result = resolve_block_inputs(&block, &view, 2);

        assert!(matches!(
            result,
            Err(ChainError::Consensus(ConsensusError::MissingInput))
        ));
    }

    #[test]
    fn intra_block_chain_resolves_and_nets_out() {
        let funding = funding_tx(7, 10 * COIN);
        let entry = UnspentOutputs::from_transaction(&funding, 1);
        let view = view_with(vec![(funding.txid(), entry)]);

        let hop = spend_of(&funding, 0, 9 * COIN);
        let hop_spend = spend_of(&hop, 0, 8 * COIN);

        let block = block_of(vec![coinbase(50 * COIN), hop.clone(), hop_spend]);
        let (resolved, changes) = resolve_block_inputs(&block, &view, 2).unwrap();

        assert_eq!(resolved[2][0].output.value, 9 * COIN);
        // the hop output is consumed inside the block and its only
        // output netted away, so the entry never reaches the coinview
        assert!(!changes
            .created
            .iter()
            .any(|(txid, _)| *txid == hop.txid()));
        // spends only reference the pre-existing output
        assert_eq!(changes.spends, vec![(funding.txid(), 0)]);
    }

    #[test]
    fn double_spend_within_block_fails() {
        let funding = funding_tx(7, 10 * COIN);
        let entry = UnspentOutputs::from_transaction(&funding, 1);
        let view = view_with(vec![(funding.txid(), entry)]);

        let block = block_of(vec![
            coinbase(50 * COIN),
            spend_of(&funding, 0, COIN),
            spend_of(&funding, 0, 2 * COIN),
        ]);

        assert!(matches!(
            resolve_block_inputs(&block, &view, 2),
            Err(ChainError::Consensus(ConsensusError::MissingInput))
        ));
    }

    #[test]
    fn immature_coinbase_spend_rejected() {
        let mut funding = funding_tx(7, 10 * COIN);
        funding.inputs[0].prevout = OutPoint::NULL; // make it a coinbase
        let entry = UnspentOutputs::from_transaction(&funding, 1);
        assert!(entry.is_coinbase);

        let view = view_with(vec![(funding.txid(), entry)]);
        let block = block_of(vec![coinbase(50 * COIN), spend_of(&funding, 0, COIN)]);

        let (resolved, _) = resolve_block_inputs(&block, &view, 10).unwrap();
        let params = xds_primitives::NetworkParams::mainnet();

        let ctx = FullContext {
            params: &params,
            block: &block,
            height: 10,
            resolved,
            stake_modifier: Hash::ZERO,
        };

        assert_eq!(
            MaturityRule.check(&ctx),
            Err(ConsensusError::ImmatureSpend)
        );

        // the same spend at height 51 has ripened
        let (resolved, _) = resolve_block_inputs(&block, &view, 51).unwrap();
        let ctx = FullContext {
            params: &params,
            block: &block,
            height: 51,
            resolved,
            stake_modifier: Hash::ZERO,
        };
        assert!(MaturityRule.check(&ctx).is_ok());
    }

    #[test]
    fn overclaiming_coinbase_rejected() {
        let funding = funding_tx(7, 10 * COIN);
        let entry = UnspentOutputs::from_transaction(&funding, 1);
        let view = view_with(vec![(funding.txid(), entry.clone())]);
        let params = xds_primitives::NetworkParams::mainnet();

        // fee is 1 coin, subsidy 50: a 52-coin coinbase overclaims
        let block = block_of(vec![coinbase(52 * COIN), spend_of(&funding, 0, 9 * COIN)]);
        let (resolved, _) = resolve_block_inputs(&block, &view, 2).unwrap();

        let ctx = FullContext {
            params: &params,
            block: &block,
            height: 2,
            resolved,
            stake_modifier: Hash::ZERO,
        };

        assert_eq!(
            FeeAndSubsidyRule.check(&ctx),
            Err(ConsensusError::BadSubsidy)
        );

        // 51 coins (subsidy + fee) is the exact budget
        let block = block_of(vec![coinbase(51 * COIN), spend_of(&funding, 0, 9 * COIN)]);
        let (resolved, _) = resolve_block_inputs(&block, &view, 2).unwrap();
        let ctx = FullContext {
            params: &params,
            block: &block,
            height: 2,
            resolved,
            stake_modifier: Hash::ZERO,
        };
        assert!(FeeAndSubsidyRule.check(&ctx).is_ok());
    }

    #[test]
    fn kernel_input_built_from_coinstake() {
        let funding = funding_tx(7, 10 * COIN);
        let entry = UnspentOutputs::from_transaction(&funding, 1);
        let view = view_with(vec![(funding.txid(), entry)]);
        let params = xds_primitives::NetworkParams::mainnet();

        let mut coinstake = spend_of(&funding, 0, 10 * COIN);
        coinstake.time = 1_578_008_192;
        coinstake.outputs.insert(0, TxOutput::new(0, Vec::new()));

        let mut block = block_of(vec![coinbase(0), coinstake]);
        block.signature = vec![0x30, 0x44];

        let (resolved, _) = resolve_block_inputs(&block, &view, 2).unwrap();
        let ctx = FullContext {
            params: &params,
            block: &block,
            height: 2,
            resolved,
            stake_modifier: Hasher::hash256(b"modifier"),
        };

        let kernel = StakeKernelRule::kernel_input(&ctx).unwrap();
        assert_eq!(kernel.staked_value, 10 * COIN);
        assert_eq!(kernel.prev_out, OutPoint::new(funding.txid(), 0));
        assert_eq!(kernel.stake_time, 1_578_008_192);
    }
}
