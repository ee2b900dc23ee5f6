//! Interfaces to the services the engine relies on but does not implement:
//! the PIN-gated key vault, fee estimation, raw transaction lookup and
//! broadcast.

use std::collections::HashMap;

use async_trait::async_trait;
use miniscript::bitcoin::bip32::Fingerprint;
use miniscript::bitcoin::Txid;

use crate::error::SendError;
use crate::keys::SecretMaterial;
use crate::types::FeeEstimates;

/// Which stored secret to decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRef {
    /// The key material of the wallet being spent from.
    Wallet,
    /// A cosigner seed held on this device.
    Cosigner(Fingerprint),
    /// The device-wide seed.
    GlobalSeed,
}

/// Decrypts key material on demand.
///
/// `Ok(None)` means nothing is stored under that reference. A wrong PIN or a
/// storage failure is `Err(SendError::KeyAccessFailure(..))`.
pub trait KeyVault {
    fn unlock(&self, pin: &str, key: &KeyRef) -> Result<Option<SecretMaterial>, SendError>;
}

#[async_trait]
pub trait FeeEstimateSource: Send + Sync {
    async fn fetch_fee_estimates(&self) -> Result<FeeEstimates, SendError>;
}

#[async_trait]
pub trait RawTransactionSource: Send + Sync {
    /// Fetches raw transaction hex for every txid in one round trip.
    ///
    /// Txids the source does not know are simply absent from the result.
    async fn fetch_raw_transactions(
        &self,
        txids: &[Txid],
    ) -> Result<HashMap<Txid, String>, SendError>;
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Submits a raw transaction.
    ///
    /// A node refusing the transaction should be reported with
    /// [`SendError::broadcast_rejected`], transport failures as
    /// [`SendError::NetworkError`].
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, SendError>;
}
