//! Fee and safety policy wrapped around selection and building.

pub mod debounce;
pub mod enrichment;

use miniscript::bitcoin::FeeRate;
use tracing::info;

use crate::config::EngineConfig;
use crate::types::Utxo;

pub use debounce::FeeEstimateDebouncer;
pub use enrichment::{LegacyEnricher, RawTxCache};

/// Fee rate actually used when spending `inputs`.
///
/// Spending an unconfirmed output raises the rate to the configured RBF
/// floor so a later replacement can still pay strictly more. The adjustment
/// is silent apart from a log line.
pub fn effective_fee_rate(requested: FeeRate, inputs: &[Utxo], config: &EngineConfig) -> FeeRate {
    let floor = FeeRate::from_sat_per_vb_unchecked(config.rbf_min_fee_rate_sat_vb);
    if requested < floor && inputs.iter().any(Utxo::is_unconfirmed) {
        info!(
            "raising fee rate from {} to {} sat/vB for unconfirmed inputs",
            requested.to_sat_per_vb_ceil(),
            config.rbf_min_fee_rate_sat_vb
        );
        floor
    } else {
        requested
    }
}
