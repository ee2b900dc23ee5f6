//! One send attempt from selection to broadcast.
//!
//! A [`SendAttempt`] owns everything scoped to a single send: the previous
//! transaction cache and the collaborators. Dropping it abandons the attempt;
//! key material never outlives the call that unlocked it.

use std::sync::{Arc, Mutex};

use miniscript::bitcoin::bip32::DerivationPath;
use miniscript::bitcoin::secp256k1::{All, Secp256k1};
use miniscript::bitcoin::{FeeRate, OutPoint, Txid};
use tracing::{debug, info};

use crate::builder::{BuiltTransaction, TransactionBuilder};
use crate::collaborators::{Broadcaster, KeyRef, KeyVault, RawTransactionSource};
use crate::config::EngineConfig;
use crate::error::SendError;
use crate::keys::KeySigner;
use crate::multisig::coordinator::MultisigCoordinator;
use crate::multisig::MultisigConfig;
use crate::policy::{LegacyEnricher, RawTxCache};
use crate::psbt::finalize::finalize_psbt;
use crate::psbt::sign::{sign_single_key, AddressPaths};
use crate::types::{Recipient, Utxo, WalletCapability};

/// What the user asked to send.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub recipients: Vec<Recipient>,
    pub change_address: Option<String>,
    /// Sweep to the last recipient instead of paying fixed amounts.
    pub send_max: bool,
    pub coin_control: Option<Vec<OutPoint>>,
    /// Address to derivation path. Full paths for single-key wallets, paths
    /// relative to the cosigner accounts for multisig.
    pub paths: AddressPaths,
}

impl SendRequest {
    pub fn to(recipient: Recipient) -> Self {
        SendRequest {
            recipients: vec![recipient],
            ..Default::default()
        }
    }

    pub fn sweep(address: impl Into<String>) -> Self {
        SendRequest {
            recipients: vec![Recipient::new(address, 0)],
            send_max: true,
            ..Default::default()
        }
    }

    pub fn with_change_address(mut self, address: impl Into<String>) -> Self {
        self.change_address = Some(address.into());
        self
    }

    pub fn with_coin_control(mut self, outpoints: Vec<OutPoint>) -> Self {
        self.coin_control = Some(outpoints);
        self
    }

    pub fn with_path(mut self, address: impl Into<String>, path: DerivationPath) -> Self {
        self.paths.insert(address.into(), path);
        self
    }
}

#[derive(Debug)]
pub enum SendOutcome {
    Broadcast { txid: Txid, fee: u64 },
    UnsignedPsbt { psbt_base64: String, fee: u64 },
    /// Multisig wallets continue in the coordinator.
    Coordinator(Box<MultisigCoordinator>),
}

pub struct SendAttempt {
    config: EngineConfig,
    capability: WalletCapability,
    multisig: Option<MultisigConfig>,
    raw_tx_source: Arc<dyn RawTransactionSource>,
    broadcaster: Arc<dyn Broadcaster>,
    cache: Mutex<RawTxCache>,
    secp: Secp256k1<All>,
}

impl SendAttempt {
    pub fn new(
        config: EngineConfig,
        capability: WalletCapability,
        raw_tx_source: Arc<dyn RawTransactionSource>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        SendAttempt {
            cache: Mutex::new(RawTxCache::new(config.raw_tx_cache_capacity)),
            config,
            capability,
            multisig: None,
            raw_tx_source,
            broadcaster,
            secp: Secp256k1::new(),
        }
    }

    pub fn with_multisig(mut self, multisig: MultisigConfig) -> Self {
        self.multisig = Some(multisig);
        self
    }

    pub fn capability(&self) -> WalletCapability {
        self.capability
    }

    fn builder(&self, request: &SendRequest) -> Result<TransactionBuilder, SendError> {
        let builder = match (self.capability, &self.multisig) {
            (WalletCapability::Multisig, Some(multisig)) => {
                TransactionBuilder::multisig(self.config.clone(), multisig.clone())
            }
            (WalletCapability::Multisig, None) => {
                return Err(SendError::InvalidMultisigConfig(
                    "multisig wallet without a configuration".to_string(),
                ))
            }
            _ => TransactionBuilder::new(self.config.clone()),
        };
        Ok(match &request.coin_control {
            Some(outpoints) => builder.with_coin_control(outpoints.clone()),
            None => builder,
        })
    }

    /// Selects, enriches legacy inputs and builds the unsigned PSBT.
    pub async fn prepare(
        &self,
        request: &SendRequest,
        utxos: &[Utxo],
        fee_rate: FeeRate,
    ) -> Result<BuiltTransaction, SendError> {
        let builder = self.builder(request)?;
        let mut plan = builder.plan(
            &request.recipients,
            utxos,
            request.change_address.as_deref(),
            fee_rate,
            request.send_max,
        )?;
        if plan.needs_previous_transactions() {
            LegacyEnricher::new(self.raw_tx_source.as_ref(), &self.cache)
                .enrich(&mut plan.inputs, &plan.input_types)
                .await?;
        }
        let psbt = builder.to_psbt(&plan, &request.paths)?;
        debug!("prepared PSBT with {} inputs", psbt.inputs.len());
        Ok(BuiltTransaction { psbt, plan })
    }

    /// Runs the whole attempt for this wallet's capability.
    ///
    /// Full-sign wallets unlock their key, sign, finalize and broadcast.
    /// Watch-only wallets get the unsigned PSBT. Multisig wallets get a
    /// coordinator to collect signatures with; the vault is not touched.
    pub async fn execute(
        &self,
        request: &SendRequest,
        utxos: &[Utxo],
        fee_rate: FeeRate,
        vault: &dyn KeyVault,
        pin: &str,
    ) -> Result<SendOutcome, SendError> {
        let built = self.prepare(request, utxos, fee_rate).await?;
        match self.capability {
            WalletCapability::WatchOnly => Ok(SendOutcome::UnsignedPsbt {
                psbt_base64: built.psbt_base64(),
                fee: built.fee(),
            }),
            WalletCapability::Multisig => {
                let multisig = self.multisig.clone().ok_or_else(|| {
                    SendError::InvalidMultisigConfig(
                        "multisig wallet without a configuration".to_string(),
                    )
                })?;
                let coordinator =
                    MultisigCoordinator::new(built.psbt, multisig, self.config.network)?;
                Ok(SendOutcome::Coordinator(Box::new(coordinator)))
            }
            WalletCapability::FullSign => {
                let fee = built.fee();
                let txid = self.sign_and_broadcast(built, &request.paths, vault, pin).await?;
                Ok(SendOutcome::Broadcast { txid, fee })
            }
        }
    }

    async fn sign_and_broadcast(
        &self,
        built: BuiltTransaction,
        paths: &AddressPaths,
        vault: &dyn KeyVault,
        pin: &str,
    ) -> Result<Txid, SendError> {
        let mut psbt = built.psbt;
        {
            let material = vault.unlock(pin, &KeyRef::Wallet)?.ok_or_else(|| {
                SendError::KeyAccessFailure("no key material stored for this wallet".to_string())
            })?;
            let mut signer = KeySigner::from_material(&material, self.config.network)?;
            let signed = sign_single_key(&self.secp, &mut psbt, &signer, paths, self.config.network);
            signer.destroy();
            debug!("signed {} inputs", signed?);
        }

        let finalized = finalize_psbt(&self.secp, &mut psbt)?;
        let txid = self.broadcaster.broadcast(&finalized.raw_hex).await?;
        info!("broadcast transaction {}", txid);
        Ok(txid)
    }
}
