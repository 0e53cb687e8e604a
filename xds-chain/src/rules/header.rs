//! Header pipeline rules.

use num_bigint::BigUint;
use xds_primitives::CompactTarget;

use crate::error::ConsensusError;
use crate::indexer::ChainedHeader;

use super::{HeaderContext, HeaderRule};

pub struct HeaderVersionRule;

impl HeaderRule for HeaderVersionRule {
    fn name(&self) -> &'static str {
        "HeaderVersionRule"
    }

    fn check(&self, ctx: &HeaderContext) -> Result<(), ConsensusError> {
        if ctx.header.version < 1 {
            return Err(ConsensusError::BadVersion);
        }

        Ok(())
    }
}

/// Height-pinned hashes must match exactly.
pub struct CheckpointRule;

impl HeaderRule for CheckpointRule {
    fn name(&self) -> &'static str {
        "CheckpointRule"
    }

    fn check(&self, ctx: &HeaderContext) -> Result<(), ConsensusError> {
        if let Some(pinned) = ctx.params.checkpoint_at(ctx.height()) {
            if *pinned != ctx.header.hash() {
                return Err(ConsensusError::CheckpointMismatch);
            }
        }

        Ok(())
    }
}

/// Future drift bound and chain-time monotonicity.
pub struct HeaderTimeRule;

impl HeaderRule for HeaderTimeRule {
    fn name(&self) -> &'static str {
        "HeaderTimeRule"
    }

    fn check(&self, ctx: &HeaderContext) -> Result<(), ConsensusError> {
        let drift_limit = ctx.now_unix + ctx.params.max_future_drift_secs;
        if u64::from(ctx.header.time) > drift_limit {
            return Err(ConsensusError::TimeTooNew);
        }

        if ctx.header.time <= ctx.prev.header.time {
            return Err(ConsensusError::TimeTooOld);
        }

        Ok(())
    }
}

/// Expected compact bits for the block after `prev`.
///
/// Difficulty moves once per retarget window by the ratio of actual
/// to scheduled timespan, clamped to 4x either way and floored at the
/// proof-of-work limit.
pub fn required_bits(
    prev: &std::sync::Arc<ChainedHeader>,
    params: &xds_primitives::NetworkParams,
) -> CompactTarget {
    let next_height = prev.height + 1;
    let interval = params.retarget_interval();

    if interval == 0 || next_height % interval != 0 {
        return prev.header.bits;
    }

    let window_start = prev
        .ancestor_at(next_height.saturating_sub(interval))
        .expect("window start is an ancestor of prev");

    let scheduled = params.pow_target_timespan_secs;
    let actual = u64::from(prev.header.time.saturating_sub(window_start.header.time))
        .clamp(scheduled / 4, scheduled * 4);

    let limit = params
        .pow_limit_bits
        .to_target()
        .expect("configured limit is a valid target");

    let prev_target = prev
        .header
        .bits
        .to_target()
        .unwrap_or_else(|| limit.clone());

    let retargeted = prev_target * BigUint::from(actual) / BigUint::from(scheduled);

    CompactTarget::from_target(&retargeted.min(limit))
}

/// Proof-of-work and retarget verification.
///
/// A header arriving in proven form is a PoS header; its eligibility
/// is the kernel's business, so only the retarget schedule applies.
pub struct DifficultyRule;

impl HeaderRule for DifficultyRule {
    fn name(&self) -> &'static str {
        "DifficultyRule"
    }

    fn check(&self, ctx: &HeaderContext) -> Result<(), ConsensusError> {
        if ctx.header.bits != required_bits(ctx.prev, ctx.params) {
            return Err(ConsensusError::BadDiffBits);
        }

        if ctx.proven.is_none() && !ctx.header.meets_own_target() {
            return Err(ConsensusError::BadPoWHash);
        }

        Ok(())
    }
}

/// Structural checks on proven headers: the coinstake must be bound
/// to the merkle root, carry a signature, and respect the stake time
/// mask. Kernel eligibility runs in full validation where the staked
/// output's value is known.
pub struct ProvenHeaderRule;

impl HeaderRule for ProvenHeaderRule {
    fn name(&self) -> &'static str {
        "ProvenHeaderRule"
    }

    fn check(&self, ctx: &HeaderContext) -> Result<(), ConsensusError> {
        let Some(proven) = ctx.proven else {
            return Ok(());
        };

        if !proven.coinstake.is_coinstake() {
            return Err(ConsensusError::BadProvenHeader);
        }

        if !proven.coinstake_is_included() {
            return Err(ConsensusError::BadProvenHeader);
        }

        if proven.signature.is_empty() {
            return Err(ConsensusError::BadBlockSignature);
        }

        if proven.coinstake.time != ctx.header.time {
            return Err(ConsensusError::BadStakeTime);
        }

        if ctx.header.time & ctx.params.stake_timestamp_mask != 0 {
            return Err(ConsensusError::BadStakeTime);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::testutil::{extend, header_on};
    use crate::indexer::ChainIndexer;
    use crate::rules::RuleEngine;
    use xds_primitives::NetworkParams;

    fn setup() -> (NetworkParams, ChainIndexer, RuleEngine) {
        (
            NetworkParams::mainnet(),
            ChainIndexer::new(&NetworkParams::mainnet()),
            RuleEngine::standard(),
        )
    }

    fn ctx_now(header_time: u32) -> u64 {
        u64::from(header_time)
    }

    #[test]
    fn future_drift_rejected() {
        let (params, indexer, engine) = setup();
        let genesis = indexer.genesis();

        let mut header = header_on(&genesis, 1);
        header.time = genesis.header.time + 20 * 60;

        let result = engine.validate_header(&HeaderContext {
            params: &params,
            header: &header,
            prev: &genesis,
            proven: None,
            // local clock sits at the parent's time
            now_unix: ctx_now(genesis.header.time),
        });

        assert_eq!(result, Err(ConsensusError::TimeTooNew));
    }

    #[test]
    fn non_monotonic_time_rejected() {
        let (params, indexer, engine) = setup();
        let genesis = indexer.genesis();

        let mut header = header_on(&genesis, 1);
        header.time = genesis.header.time;

        let result = engine.validate_header(&HeaderContext {
            params: &params,
            header: &header,
            prev: &genesis,
            proven: None,
            now_unix: ctx_now(header.time),
        });

        assert_eq!(result, Err(ConsensusError::TimeTooOld));
    }

    #[test]
    fn bits_must_follow_schedule() {
        let (params, indexer, engine) = setup();
        let genesis = indexer.genesis();

        let mut header = header_on(&genesis, 1);
        header.bits = CompactTarget(0x1d00_ffff);

        let result = engine.validate_header(&HeaderContext {
            params: &params,
            header: &header,
            prev: &genesis,
            proven: None,
            now_unix: ctx_now(header.time),
        });

        assert_eq!(result, Err(ConsensusError::BadDiffBits));
    }

    #[test]
    fn mid_window_keeps_previous_bits() {
        let (params, indexer, _) = setup();
        let tip = extend(&indexer, &indexer.genesis(), 3, 1);

        assert_eq!(required_bits(&tip, &params), tip.header.bits);
    }

    #[test]
    fn checkpoint_mismatch_rejected() {
        let (mut params, indexer, engine) = setup();
        let genesis = indexer.genesis();

        params
            .checkpoints
            .insert(1, xds_crypto::Hash::new([0xaa; 32]));

        let header = header_on(&genesis, 1);

        let result = engine.validate_header(&HeaderContext {
            params: &params,
            header: &header,
            prev: &genesis,
            proven: None,
            now_unix: ctx_now(header.time),
        });

        assert_eq!(result, Err(ConsensusError::CheckpointMismatch));
    }
}
