//! The rule engine: four deterministic pipelines driven by rule
//! lists configured at startup.
//!
//! Each rule is a named unit; the first failing rule aborts its
//! pipeline and the failure is logged as `[FAIL_<RuleName>]` with the
//! error's stable kind. Header and Integrity failures are the
//! cheapest and run on the hot path; Partial runs on a worker pool;
//! Full runs serialized on the chain writer.

pub mod full;
pub mod header;
pub mod integrity;
pub mod partial;

use std::sync::Arc;

use tracing::warn;
use xds_primitives::{Block, BlockHeader, NetworkParams, ProvenHeader};

use crate::error::ConsensusError;
use crate::indexer::ChainedHeader;

pub use full::{FullContext, ResolvedInput};

/// Context for header rules: the header, its chained parent and the
/// wall clock.
pub struct HeaderContext<'a> {
    pub params: &'a NetworkParams,
    pub header: &'a BlockHeader,
    pub prev: &'a Arc<ChainedHeader>,
    /// Present when the header arrived in proven form.
    pub proven: Option<&'a ProvenHeader>,
    pub now_unix: u64,
}

impl HeaderContext<'_> {
    pub fn height(&self) -> u64 {
        self.prev.height + 1
    }
}

/// Context for integrity rules: the raw block before queueing.
pub struct IntegrityContext<'a> {
    pub params: &'a NetworkParams,
    pub block: &'a Block,
}

/// Context for partial validation: block plus header-chain facts, no
/// coinview access.
pub struct PartialContext<'a> {
    pub params: &'a NetworkParams,
    pub block: &'a Block,
    pub height: u64,
}

pub trait HeaderRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &HeaderContext) -> Result<(), ConsensusError>;
}

pub trait IntegrityRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &IntegrityContext) -> Result<(), ConsensusError>;
}

pub trait PartialRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &PartialContext) -> Result<(), ConsensusError>;
}

pub trait FullRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &FullContext) -> Result<(), ConsensusError>;
}

fn run<C, R: ?Sized>(
    rules: &[Box<R>],
    ctx: &C,
    name: impl Fn(&R) -> &'static str,
    check: impl Fn(&R, &C) -> Result<(), ConsensusError>,
) -> Result<(), ConsensusError> {
    for rule in rules {
        if let Err(err) = check(rule, ctx) {
            warn!("[FAIL_{}] {} ({})", name(rule), err, err.kind());
            return Err(err);
        }
    }

    Ok(())
}

/// The configured rule lists. Order within each pipeline is fixed at
/// construction and identical on every node.
pub struct RuleEngine {
    header_rules: Vec<Box<dyn HeaderRule>>,
    integrity_rules: Vec<Box<dyn IntegrityRule>>,
    partial_rules: Vec<Box<dyn PartialRule>>,
    full_rules: Vec<Box<dyn FullRule>>,
}

impl RuleEngine {
    /// Assemble an engine from explicit rule lists. Order is
    /// preserved and becomes the pipeline order on this node.
    pub fn new(
        header_rules: Vec<Box<dyn HeaderRule>>,
        integrity_rules: Vec<Box<dyn IntegrityRule>>,
        partial_rules: Vec<Box<dyn PartialRule>>,
        full_rules: Vec<Box<dyn FullRule>>,
    ) -> Self {
        Self {
            header_rules,
            integrity_rules,
            partial_rules,
            full_rules,
        }
    }

    /// The standard pipeline configuration.
    pub fn standard() -> Self {
        Self {
            header_rules: vec![
                Box::new(header::HeaderVersionRule),
                Box::new(header::CheckpointRule),
                Box::new(header::HeaderTimeRule),
                Box::new(header::DifficultyRule),
                Box::new(header::ProvenHeaderRule),
            ],
            integrity_rules: vec![
                Box::new(integrity::MerkleRootRule),
                Box::new(integrity::BlockSizeRule),
                Box::new(integrity::WitnessCommitmentRule),
            ],
            partial_rules: vec![
                Box::new(partial::CoinbasePlacementRule),
                Box::new(partial::CoinstakePlacementRule),
                Box::new(partial::TxStructureRule),
                Box::new(partial::WitnessPresentRule),
                Box::new(partial::ScriptSigEmptyRule),
                Box::new(partial::OutputWhitelistRule),
                Box::new(partial::SigOpCountRule),
                Box::new(partial::LockTimeRule),
            ],
            full_rules: vec![
                Box::new(full::MaturityRule),
                Box::new(full::FeeAndSubsidyRule),
                Box::new(full::StakeKernelRule),
                Box::new(full::BlockSignatureRule),
                Box::new(full::ScriptVerifyRule),
            ],
        }
    }

    pub fn validate_header(&self, ctx: &HeaderContext) -> Result<(), ConsensusError> {
        run(&self.header_rules, ctx, |r| r.name(), |r, c| r.check(c))
    }

    pub fn validate_integrity(&self, ctx: &IntegrityContext) -> Result<(), ConsensusError> {
        run(&self.integrity_rules, ctx, |r| r.name(), |r, c| r.check(c))
    }

    pub fn validate_partial(&self, ctx: &PartialContext) -> Result<(), ConsensusError> {
        run(&self.partial_rules, ctx, |r| r.name(), |r, c| r.check(c))
    }

    pub fn validate_full(&self, ctx: &FullContext) -> Result<(), ConsensusError> {
        run(&self.full_rules, ctx, |r| r.name(), |r, c| r.check(c))
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::standard()
    }
}
