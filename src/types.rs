use miniscript::bitcoin::{Amount, FeeRate, OutPoint, ScriptBuf, TxOut};
use serde::{Deserialize, Serialize};

/// A spendable output owned by the wallet.
///
/// The wallet store owns these; the engine only reads them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub address: String,
    pub script_pubkey: ScriptBuf,
    pub confirmations: u32,
    /// Full previous transaction, required to sign legacy inputs.
    pub raw_tx_hex: Option<String>,
    pub frozen: bool,
    pub locked: bool,
}

impl Utxo {
    pub fn new(
        outpoint: OutPoint,
        value: u64,
        address: impl Into<String>,
        script_pubkey: ScriptBuf,
    ) -> Self {
        Utxo {
            outpoint,
            value,
            address: address.into(),
            script_pubkey,
            confirmations: 1,
            raw_tx_hex: None,
            frozen: false,
            locked: false,
        }
    }

    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn with_raw_tx_hex(mut self, hex: impl Into<String>) -> Self {
        self.raw_tx_hex = Some(hex.into());
        self
    }

    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.confirmations == 0
    }

    /// Frozen and locked outputs are only spent through coin control.
    pub fn is_auto_spendable(&self) -> bool {
        !self.frozen && !self.locked
    }

    pub fn txout(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.value),
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Recipient {
    pub fn new(address: impl Into<String>, amount: u64) -> Self {
        Recipient {
            address: address.into(),
            amount,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Rows left blank in a multi-recipient form.
    pub fn is_empty(&self) -> bool {
        self.address.trim().is_empty() || self.amount == 0
    }
}

/// What the engine does with a built transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletCapability {
    /// Sign locally and broadcast.
    FullSign,
    /// Export the unsigned PSBT for an external signer.
    WatchOnly,
    /// Hand the PSBT to the multisig coordinator.
    Multisig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTier {
    Fast,
    #[default]
    Normal,
    Slow,
}

/// Fee estimates in sat/vB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimates {
    pub fast: u64,
    pub normal: u64,
    pub slow: u64,
}

impl FeeEstimates {
    pub fn sat_per_vb(&self, tier: FeeTier) -> u64 {
        match tier {
            FeeTier::Fast => self.fast,
            FeeTier::Normal => self.normal,
            FeeTier::Slow => self.slow,
        }
    }

    /// Rate for a tier, never below 1 sat/vB.
    pub fn rate_for(&self, tier: FeeTier) -> FeeRate {
        FeeRate::from_sat_per_vb_unchecked(self.sat_per_vb(tier).max(1))
    }
}
