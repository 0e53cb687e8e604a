//! The mempool: fee-rate ordered pending transactions with ancestor
//! package accounting, replacement policy and reorg reconciliation.

mod pool;

pub use pool::{Mempool, MempoolConfig, MempoolEntry, PackageStats};

use thiserror::Error;

use xds_chain::{ChainError, ConsensusError};

/// Why a transaction was refused admission.
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("transaction is already in the pool")]
    AlreadyInPool,

    /// A policy or consensus check failed; carries the stable kind.
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("replacement does not pay for the transactions it evicts")]
    RbfNotAllowed,

    #[error("ancestor package too large: {count} transactions, {vsize} vbytes")]
    AncestorLimit { count: usize, vsize: usize },

    #[error("descendant package too large: {count} transactions, {vsize} vbytes")]
    DescendantLimit { count: usize, vsize: usize },

    #[error("transaction relay is rate limited")]
    RateLimited,

    #[error("transaction is not standard: {0}")]
    NonStandard(&'static str),

    #[error("chain state unavailable")]
    Chain(#[from] ChainError),
}

impl MempoolError {
    /// Stable machine-readable kind for peers and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyInPool => "AlreadyInPool",
            Self::Consensus(inner) => inner.kind(),
            Self::RbfNotAllowed => "RbfNotAllowed",
            Self::AncestorLimit { .. } => "AncestorLimit",
            Self::DescendantLimit { .. } => "DescendantLimit",
            Self::RateLimited => "RateLimited",
            Self::NonStandard(_) => "NonStandard",
            Self::Chain(_) => "ChainUnavailable",
        }
    }
}
