//! Consensus and chain state for the XDS node: the rule engine, the
//! coinview, the stake chain, the header index, the consensus manager
//! and the block download scheduler.

pub mod coinview;
pub mod error;
pub mod events;
pub mod indexer;
pub mod invalid;
pub mod manager;
pub mod puller;
pub mod rules;
pub mod script;
pub mod stake;
pub mod store;

pub use error::{ChainError, ConsensusError};
pub use events::ChainEvent;
pub use indexer::{ChainIndexer, ChainedHeader, ValidationState};
pub use manager::ConsensusManager;

/// Identifier the consensus layer uses for a remote peer.
pub type PeerId = u64;
