//! Error taxonomy of the chain core.

use thiserror::Error;

/// A consensus rule rejected a block or transaction.
///
/// Every variant maps to a stable machine-readable kind via
/// [`ConsensusError::kind`]; peers and logs key off the kind, never
/// the display string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConsensusError {
    #[error("block version is not accepted")]
    BadVersion,

    #[error("merkle root does not commit to the block's transactions")]
    BadMerkleRoot,

    #[error("transaction list is mutated")]
    BadMerkleMutation,

    #[error("block exceeds size or weight limits")]
    BadBlockLength,

    #[error("witness commitment is missing or wrong")]
    BadWitnessCommitment,

    #[error("header hash does not meet the claimed proof-of-work target")]
    BadPoWHash,

    #[error("difficulty bits differ from the expected retarget value")]
    BadDiffBits,

    #[error("header timestamp is too far in the future")]
    TimeTooNew,

    #[error("header timestamp does not advance the chain")]
    TimeTooOld,

    #[error("header does not match a pinned checkpoint")]
    CheckpointMismatch,

    #[error("header could not be connected to a known parent")]
    HeaderInvalid,

    #[error("proven header carries an unprovable coinstake")]
    BadProvenHeader,

    #[error("block signature is missing or does not verify")]
    BadBlockSignature,

    #[error("stake kernel hash does not meet the weighted target")]
    BadStakeKernel,

    #[error("stake timestamp violates the granularity mask")]
    BadStakeTime,

    #[error("first transaction must be the only coinbase")]
    BadCoinbasePlacement,

    #[error("coinstake transaction is misplaced")]
    BadCoinstakePlacement,

    #[error("transaction structure is invalid")]
    BadTransaction,

    #[error("transaction spends the same output twice")]
    DuplicateInput,

    #[error("non-coinbase input carries a non-empty scriptSig")]
    ScriptSigNotEmpty,

    #[error("input is missing required witness data")]
    MissingWitness,

    #[error("output script is not a whitelisted template")]
    OutputNotWhitelisted,

    #[error("transaction is not final at this height and time")]
    NonFinalTransaction,

    #[error("block exceeds the signature-operation budget")]
    BadSigOpCount,

    #[error("input references a missing or spent output")]
    MissingInput,

    #[error("coinbase or coinstake output is spent before maturity")]
    ImmatureSpend,

    #[error("amounts are outside the monetary range")]
    BadAmount,

    #[error("fee is below the absolute minimum transaction fee")]
    FeeBelowAbsoluteMinTxFee,

    #[error("block claims more than subsidy plus fees")]
    BadSubsidy,

    #[error("input script or signature does not verify")]
    BadScript,

    #[error("reorg depth exceeds the maximum allowed")]
    MaxReorgViolation,

    #[error("block is on the invalid list")]
    KnownInvalid,
}

impl ConsensusError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadVersion => "BadVersion",
            Self::BadMerkleRoot => "BadMerkleRoot",
            Self::BadMerkleMutation => "BadMerkleMutation",
            Self::BadBlockLength => "BadBlockLength",
            Self::BadWitnessCommitment => "BadWitnessCommitment",
            Self::BadPoWHash => "BadPoWHash",
            Self::BadDiffBits => "BadDiffBits",
            Self::TimeTooNew => "TimeTooNew",
            Self::TimeTooOld => "TimeTooOld",
            Self::CheckpointMismatch => "CheckpointMismatch",
            Self::HeaderInvalid => "HeaderInvalid",
            Self::BadProvenHeader => "BadProvenHeader",
            Self::BadBlockSignature => "BadBlockSignature",
            Self::BadStakeKernel => "BadStakeKernel",
            Self::BadStakeTime => "BadStakeTime",
            Self::BadCoinbasePlacement => "BadCoinbasePlacement",
            Self::BadCoinstakePlacement => "BadCoinstakePlacement",
            Self::BadTransaction => "BadTransaction",
            Self::DuplicateInput => "DuplicateInput",
            Self::ScriptSigNotEmpty => "ScriptSigNotEmpty",
            Self::MissingWitness => "MissingWitness",
            Self::OutputNotWhitelisted => "OutputNotWhitelisted",
            Self::NonFinalTransaction => "NonFinalTransaction",
            Self::BadSigOpCount => "BadSigOpCount",
            Self::MissingInput => "MissingInput",
            Self::ImmatureSpend => "ImmatureSpend",
            Self::BadAmount => "BadAmount",
            Self::FeeBelowAbsoluteMinTxFee => "FeeBelowAbsoluteMinTxFee",
            Self::BadSubsidy => "BadSubsidy",
            Self::BadScript => "BadScript",
            Self::MaxReorgViolation => "MaxReorgViolation",
            Self::KnownInvalid => "KnownInvalid",
        }
    }

    /// `true` when the sender of the offending data should be banned.
    pub fn bans_peer(&self) -> bool {
        !matches!(self, Self::MaxReorgViolation | Self::KnownInvalid)
    }
}

/// Failure of a chain-state operation.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("storage failure")]
    Storage(#[from] xds_storage::Error),

    #[error("malformed bytes in storage")]
    Format(#[from] xds_codec::Error),

    /// Internal postcondition failure. Fatal: the node must stop.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error(transparent)]
    Cancelled(#[from] xds_runtime::Cancelled),
}

impl ChainError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}
