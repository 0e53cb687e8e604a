//! Node assembly: the data folder, the folder lock, and the wiring
//! that turns the workspace crates into a running full node.

pub mod config;
pub mod folder;
pub mod node;

pub use config::NodeConfig;
pub use folder::{DataFolder, FolderLock};
pub use node::Node;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("data folder is locked by process {0}")]
    FolderLocked(String),

    #[error("data folder I/O failure")]
    Io(#[from] std::io::Error),

    #[error("storage failure")]
    Storage(#[from] xds_storage::Error),

    #[error("chain state failure")]
    Chain(#[from] xds_chain::ChainError),
}
