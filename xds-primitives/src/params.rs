//! Consensus and network parameters.

use std::collections::BTreeMap;

use xds_crypto::Hash;

use crate::{target::CompactTarget, Amount, COIN};

/// Everything that parameterizes consensus and the P2P surface for
/// one network profile.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network_name: &'static str,
    /// First four bytes of every wire message.
    pub magic: u32,
    pub default_port: u16,
    pub default_rpc_port: u16,
    pub default_api_port: u16,
    pub max_outbound_peers: usize,
    pub max_inbound_peers: usize,

    /// Minimum protocol version that implies proven-header support.
    pub proven_header_version: u32,
    pub protocol_version: u32,

    pub bech32_hrp: &'static str,

    /// Floor under every relayed transaction fee.
    pub min_tx_fee: Amount,
    pub subsidy_halving_interval: u64,
    pub coinbase_maturity: u64,
    pub max_reorg_length: u64,

    pub pow_limit_bits: CompactTarget,
    pub pos_limit_bits: CompactTarget,
    /// Retarget window.
    pub pow_target_timespan_secs: u64,
    pub pow_target_spacing_secs: u64,
    /// Headers this far past local time are rejected.
    pub max_future_drift_secs: u64,
    /// PoS timestamps must be zero under this mask.
    pub stake_timestamp_mask: u32,

    pub max_block_weight: usize,
    pub max_block_base_size: usize,
    pub max_block_sigops: usize,

    pub genesis_hash: Hash<32>,
    pub genesis_merkle_root: Hash<32>,
    pub genesis_time: u32,
    pub genesis_nonce: u32,
    pub genesis_bits: CompactTarget,
    pub genesis_version: i32,

    /// Opaque chain identifier; historically set from the genesis
    /// nonce rather than a registered BIP-44 coin type.
    pub coin_type: u32,

    /// Height-pinned block hashes that headers must match.
    pub checkpoints: BTreeMap<u64, Hash<32>>,
}

impl NetworkParams {
    /// The main XDS network.
    pub fn mainnet() -> Self {
        let genesis_nonce = 15_118_976;

        Self {
            network_name: "xds-main",
            magic: 0x5844_5331, // "XDS1"
            default_port: 38333,
            default_rpc_port: 48333,
            default_api_port: 48334,
            max_outbound_peers: 16,
            max_inbound_peers: 109,

            proven_header_version: 70_012,
            protocol_version: 70_012,

            bech32_hrp: "xds",

            min_tx_fee: COIN / 100,
            subsidy_halving_interval: 210_000,
            coinbase_maturity: 50,
            max_reorg_length: 125,

            pow_limit_bits: CompactTarget(0x1e0f_ffff),
            pos_limit_bits: CompactTarget(0x1e0f_ffff),
            pow_target_timespan_secs: 14 * 24 * 60 * 60,
            pow_target_spacing_secs: 10 * 60,
            max_future_drift_secs: 16 * 60,
            stake_timestamp_mask: 0x0000_000F,

            max_block_weight: 4_000_000,
            max_block_base_size: 1_000_000,
            max_block_sigops: 80_000,

            genesis_hash: parse_hash(
                "0000000e13c5bf36c155c7cb1681053d607c191fc44b863d0c5aef6d27b8eb8f",
            ),
            genesis_merkle_root: parse_hash(
                "64b35b6a1f0d58b1b5dcf1b2e6d6a55c63728e87eca27cd6a9a04e0da164e8b0",
            ),
            genesis_time: 1_578_008_160,
            genesis_nonce,
            genesis_bits: CompactTarget(0x1e0f_ffff),
            genesis_version: 1,

            coin_type: genesis_nonce,

            checkpoints: BTreeMap::new(),
        }
    }

    /// Subsidy for a block at `height`: 50 coins, halving every
    /// `subsidy_halving_interval` blocks, zero after 64 halvings.
    pub fn block_subsidy(&self, height: u64) -> Amount {
        let halvings = height / self.subsidy_halving_interval;

        if halvings >= 64 {
            return 0;
        }

        (50 * COIN) >> halvings
    }

    /// `true` once `spend_height` is deep enough past `coin_height`
    /// to spend a coinbase or coinstake output.
    pub fn is_mature(&self, coin_height: u64, spend_height: u64) -> bool {
        spend_height >= coin_height + self.coinbase_maturity
    }

    pub fn checkpoint_at(&self, height: u64) -> Option<&Hash<32>> {
        self.checkpoints.get(&height)
    }

    /// Last checkpointed height, if any.
    pub fn last_checkpoint_height(&self) -> Option<u64> {
        self.checkpoints.keys().next_back().copied()
    }

    /// Number of blocks in one retarget window.
    pub fn retarget_interval(&self) -> u64 {
        self.pow_target_timespan_secs / self.pow_target_spacing_secs
    }
}

fn parse_hash(hex: &str) -> Hash<32> {
    hex.parse().expect("hash literal is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsidy_schedule() {
        let params = NetworkParams::mainnet();

        assert_eq!(params.block_subsidy(0), 50 * COIN);
        assert_eq!(params.block_subsidy(209_999), 50 * COIN);
        assert_eq!(params.block_subsidy(210_000), 25 * COIN);
        assert_eq!(params.block_subsidy(420_000), 1_250_000_000);
        assert_eq!(params.block_subsidy(13_440_000), 0);
    }

    #[test]
    fn mainnet_profile_constants() {
        let params = NetworkParams::mainnet();

        assert_eq!(params.magic, 0x5844_5331);
        assert_eq!(params.default_port, 38333);
        assert_eq!(params.min_tx_fee, 1_000_000);
        assert_eq!(params.max_reorg_length, 125);
        assert_eq!(params.coinbase_maturity, 50);
        assert_eq!(params.retarget_interval(), 2016);
        assert_eq!(params.coin_type, params.genesis_nonce);
        assert_eq!(
            params.genesis_hash.to_string(),
            "0000000e13c5bf36c155c7cb1681053d607c191fc44b863d0c5aef6d27b8eb8f"
        );
    }

    #[test]
    fn maturity_boundary() {
        let params = NetworkParams::mainnet();

        assert!(!params.is_mature(100, 149));
        assert!(params.is_mature(100, 150));
    }
}
