//! Engine configuration passed in from the host application.

use serde::{Deserialize, Serialize};

use crate::error::SendError;
use crate::networks::Network;
use crate::types::FeeTier;

/// Outputs below this value are never created.
pub const DUST_THRESHOLD_SATS: u64 = 547;

/// Fee rate unconfirmed-input spends are raised to, in sat/vB.
pub const RBF_MIN_FEE_RATE_SAT_VB: u64 = 2;

pub const FEE_DEBOUNCE_MS: u64 = 300;
pub const FEE_CACHE_TTL_MS: u64 = 30_000;
pub const RAW_TX_CACHE_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub network: Network,
    pub dust_threshold_sats: u64,
    pub rbf_min_fee_rate_sat_vb: u64,
    pub enable_rbf: bool,
    pub fee_debounce_ms: u64,
    pub fee_cache_ttl_ms: u64,
    pub raw_tx_cache_capacity: usize,
    pub default_fee_tier: FeeTier,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            dust_threshold_sats: DUST_THRESHOLD_SATS,
            rbf_min_fee_rate_sat_vb: RBF_MIN_FEE_RATE_SAT_VB,
            enable_rbf: true,
            fee_debounce_ms: FEE_DEBOUNCE_MS,
            fee_cache_ttl_ms: FEE_CACHE_TTL_MS,
            raw_tx_cache_capacity: RAW_TX_CACHE_CAPACITY,
            default_fee_tier: FeeTier::Normal,
        }
    }
}

impl EngineConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    pub fn mainnet() -> Self {
        Self::new(Network::Bitcoin)
    }

    pub fn testnet() -> Self {
        Self::new(Network::Testnet)
    }

    pub fn from_json(json: &str) -> Result<Self, SendError> {
        serde_json::from_str(json).map_err(|e| SendError::InvalidConfig(e.to_string()))
    }

    pub fn with_rbf(mut self, enable: bool) -> Self {
        self.enable_rbf = enable;
        self
    }

    pub fn with_dust_threshold(mut self, sats: u64) -> Self {
        self.dust_threshold_sats = sats;
        self
    }

    pub fn with_rbf_min_fee_rate(mut self, sat_vb: u64) -> Self {
        self.rbf_min_fee_rate_sat_vb = sat_vb;
        self
    }

    pub fn with_fee_debounce_ms(mut self, ms: u64) -> Self {
        self.fee_debounce_ms = ms;
        self
    }

    pub fn with_raw_tx_cache_capacity(mut self, capacity: usize) -> Self {
        self.raw_tx_cache_capacity = capacity;
        self
    }

    pub fn with_default_fee_tier(mut self, tier: FeeTier) -> Self {
        self.default_fee_tier = tier;
        self
    }
}
