//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use xds_mempool::MempoolConfig;
use xds_primitives::NetworkParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// Listen for inbound peers.
    pub listen: bool,
    /// Override of the default P2P port.
    pub port: Option<u16>,
    pub max_outbound: Option<usize>,
    pub max_inbound: Option<usize>,
    /// Endpoints dialed before the address book has content.
    pub seed_peers: Vec<SocketAddr>,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            listen: true,
            port: None,
            max_outbound: None,
            max_inbound: None,
            seed_peers: Vec::new(),
        }
    }

    pub fn port(&self, params: &NetworkParams) -> u16 {
        self.port.unwrap_or(params.default_port)
    }

    pub fn max_outbound(&self, params: &NetworkParams) -> usize {
        self.max_outbound.unwrap_or(params.max_outbound_peers)
    }

    pub fn max_inbound(&self, params: &NetworkParams) -> usize {
        self.max_inbound.unwrap_or(params.max_inbound_peers)
    }

    pub fn mempool_config(&self) -> MempoolConfig {
        MempoolConfig::default()
    }
}
