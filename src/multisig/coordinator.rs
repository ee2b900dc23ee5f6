//! Signature collection over one multisig PSBT.
//!
//! ```text
//! Collecting <-> ReadyToFinalize -> Finalized -> Broadcast
//!        \______________\_______________\______> Failed
//! ```
//!
//! Signing and importing are only allowed before finalization. Every
//! mutation happens on a copy of the PSBT that replaces the live one only on
//! success.

use std::collections::HashSet;

use miniscript::bitcoin::bip32::Fingerprint;
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::secp256k1::{All, Secp256k1, Signing, Verification};
use miniscript::bitcoin::sighash::SighashCache;
use miniscript::bitcoin::{PublicKey, Txid};
use tracing::{debug, info, warn};

use super::status::cosigner_key;
use super::{compute_signature_status, Cosigner, MultisigConfig, SignatureStatus};
use crate::collaborators::{Broadcaster, KeyRef, KeyVault};
use crate::error::SendError;
use crate::keys::{KeyLocator, KeySigner, SigningMode};
use crate::networks::Network;
use crate::psbt::finalize::{finalize_psbt, FinalizedTransaction};
use crate::psbt::merge::import_signatures;
use crate::psbt::sign::{apply_signature, ecdsa_sighash};
use crate::psbt::{deserialize_base64, serialize_base64};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    Collecting,
    ReadyToFinalize,
    Finalized { raw_tx_hex: String, txid: Txid },
    Broadcast { txid: Txid },
    Failed {
        reason: String,
        /// Extracted transaction, when the failure happened at broadcast.
        raw_tx_hex: Option<String>,
    },
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Collecting => "collecting",
            CoordinatorState::ReadyToFinalize => "readyToFinalize",
            CoordinatorState::Finalized { .. } => "finalized",
            CoordinatorState::Broadcast { .. } => "broadcast",
            CoordinatorState::Failed { .. } => "failed",
        }
    }

    pub fn accepts_signatures(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Collecting | CoordinatorState::ReadyToFinalize
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The import was valid but held no signature we did not already have.
    NothingNew,
    Merged(usize),
}

impl ImportOutcome {
    pub fn merged(&self) -> usize {
        match self {
            ImportOutcome::NothingNew => 0,
            ImportOutcome::Merged(n) => *n,
        }
    }
}

/// Signs every input of `psbt` as `cosigner`.
///
/// Inputs the cosigner already signed are skipped. The derived key must match
/// the key recorded in the input's BIP32 derivation.
///
/// # Returns
/// Number of signatures added
pub fn sign_as_cosigner<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    psbt: &mut Psbt,
    cosigner: &Cosigner,
    signer: &KeySigner,
) -> Result<usize, SendError> {
    let mut working = psbt.clone();
    let unsigned_tx = working.unsigned_tx.clone();
    let mut cache = SighashCache::new(&unsigned_tx);
    let mut added = 0;

    for index in 0..working.inputs.len() {
        let pk = cosigner_key(secp, &working.inputs[index], cosigner).ok_or_else(|| {
            SendError::InvalidPsbt(format!(
                "input {} has no key for cosigner {}",
                index, cosigner.name
            ))
        })?;
        if working.inputs[index]
            .partial_sigs
            .contains_key(&PublicKey::new(pk))
        {
            continue;
        }
        let path = working.inputs[index]
            .bip32_derivation
            .get(&pk)
            .map(|(_, path)| path.clone())
            .ok_or_else(|| SendError::InvalidPsbt(format!("input {} lost its derivation", index)))?;
        let locator = KeyLocator::Path(&path);
        if signer.public_key(secp, locator)? != pk {
            return Err(SendError::KeyAccessFailure(format!(
                "local key for {} does not match input {}",
                cosigner.fingerprint, index
            )));
        }
        let (msg, sighash_type) = ecdsa_sighash(&working, index, &mut cache)?;
        let signature = signer.sign_input(secp, locator, &msg, SigningMode::Ecdsa(sighash_type))?;
        apply_signature(&mut working.inputs[index], signature, None);
        added += 1;
    }

    *psbt = working;
    Ok(added)
}

#[derive(Debug)]
pub struct MultisigCoordinator {
    psbt: Psbt,
    config: MultisigConfig,
    network: Network,
    state: CoordinatorState,
    secp: Secp256k1<All>,
}

impl MultisigCoordinator {
    pub fn new(psbt: Psbt, config: MultisigConfig, network: Network) -> Result<Self, SendError> {
        config.validate()?;
        if psbt.inputs.is_empty() {
            return Err(SendError::InvalidPsbt("PSBT has no inputs".to_string()));
        }
        let mut coordinator = MultisigCoordinator {
            psbt,
            config,
            network,
            state: CoordinatorState::Collecting,
            secp: Secp256k1::new(),
        };
        coordinator.refresh_state();
        Ok(coordinator)
    }

    pub fn from_base64(
        encoded: &str,
        config: MultisigConfig,
        network: Network,
    ) -> Result<Self, SendError> {
        Self::new(deserialize_base64(encoded)?, config, network)
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn config(&self) -> &MultisigConfig {
        &self.config
    }

    pub fn export_base64(&self) -> String {
        serialize_base64(&self.psbt)
    }

    pub fn signature_status(&self) -> SignatureStatus {
        compute_signature_status(&self.secp, &self.psbt, &self.config)
    }

    fn refresh_state(&mut self) -> SignatureStatus {
        let status = self.signature_status();
        if self.state.accepts_signatures() {
            self.state = if status.can_finalize {
                CoordinatorState::ReadyToFinalize
            } else {
                CoordinatorState::Collecting
            };
        }
        status
    }

    fn ensure_accepts_signatures(&self) -> Result<(), SendError> {
        if self.state.accepts_signatures() {
            Ok(())
        } else {
            Err(SendError::InvalidState(format!(
                "PSBT is {} and no longer accepts signatures",
                self.state.as_str()
            )))
        }
    }

    fn key_sources(&self) -> Vec<KeyRef> {
        let mut sources = vec![KeyRef::Wallet];
        sources.extend(
            self.config
                .local_cosigners()
                .map(|c| KeyRef::Cosigner(c.fingerprint)),
        );
        sources.push(KeyRef::GlobalSeed);
        sources
    }

    /// Decrypts `source` and returns a signer if it belongs to a cosigner we
    /// are still looking for.
    fn unlock_cosigner(
        &self,
        vault: &dyn KeyVault,
        pin: &str,
        source: &KeyRef,
        wanted: &dyn Fn(Fingerprint) -> bool,
    ) -> Result<Option<(Cosigner, KeySigner)>, SendError> {
        let Some(material) = vault.unlock(pin, source)? else {
            return Ok(None);
        };
        let fingerprint = match KeySigner::from_material(&material, self.network) {
            Ok(signer) => signer.fingerprint(&self.secp),
            Err(e) => {
                debug!("skipping key source {:?}: {}", source, e);
                None
            }
        };
        let Some(cosigner) = fingerprint
            .filter(|fp| wanted(*fp))
            .and_then(|fp| self.config.cosigner(fp))
        else {
            return Ok(None);
        };
        let signer = KeySigner::for_cosigner(&self.secp, &material, cosigner, self.network)?;
        Ok(Some((cosigner.clone(), signer)))
    }

    /// Signs with every local key source that matches a cosigner.
    ///
    /// Sources are tried in order: the wallet's own key, locally held
    /// cosigner seeds, then the global seed. Each fingerprint signs at most
    /// once, and decryption stops as soon as every local cosigner has signed.
    pub fn sign_with_local_keys(
        &mut self,
        vault: &dyn KeyVault,
        pin: &str,
    ) -> Result<SignatureStatus, SendError> {
        self.ensure_accepts_signatures()?;
        let status = self.signature_status();
        let mut signed: HashSet<Fingerprint> = self
            .config
            .cosigners
            .iter()
            .filter(|c| status.has_signed(c.fingerprint))
            .map(|c| c.fingerprint)
            .collect();
        let local: Vec<Fingerprint> = self.config.local_cosigners().map(|c| c.fingerprint).collect();
        let mut matched = false;
        let mut working = self.psbt.clone();

        for source in self.key_sources() {
            if !local.is_empty() && local.iter().all(|fp| signed.contains(fp)) {
                break;
            }
            let already = signed.clone();
            let wanted = move |fp: Fingerprint| !already.contains(&fp);
            let Some((cosigner, mut signer)) =
                self.unlock_cosigner(vault, pin, &source, &wanted)?
            else {
                continue;
            };
            matched = true;
            let result = sign_as_cosigner(&self.secp, &mut working, &cosigner, &signer);
            signer.destroy();
            let added = result?;
            info!(
                "cosigner {} added {} signatures",
                cosigner.fingerprint, added
            );
            signed.insert(cosigner.fingerprint);
        }

        if !matched && signed.is_empty() {
            let fingerprints: Vec<String> = local.iter().map(|fp| fp.to_string()).collect();
            return Err(SendError::NoLocalKey {
                fingerprint: fingerprints.join(","),
            });
        }
        self.psbt = working;
        Ok(self.refresh_state())
    }

    /// Signs as one specific cosigner, trying key sources in the same order
    /// and stopping at the first that matches.
    pub fn sign_with_specific_cosigner(
        &mut self,
        vault: &dyn KeyVault,
        pin: &str,
        fingerprint: Fingerprint,
    ) -> Result<SignatureStatus, SendError> {
        self.ensure_accepts_signatures()?;
        if self.config.cosigner(fingerprint).is_none() {
            return Err(SendError::InvalidMultisigConfig(format!(
                "{} is not a cosigner of this wallet",
                fingerprint
            )));
        }
        let wanted = move |fp: Fingerprint| fp == fingerprint;
        for source in self.key_sources() {
            if let Some((cosigner, mut signer)) =
                self.unlock_cosigner(vault, pin, &source, &wanted)?
            {
                let result = sign_as_cosigner(&self.secp, &mut self.psbt, &cosigner, &signer);
                signer.destroy();
                let added = result?;
                info!("cosigner {} added {} signatures", fingerprint, added);
                return Ok(self.refresh_state());
            }
        }
        Err(SendError::NoLocalKey {
            fingerprint: fingerprint.to_string(),
        })
    }

    /// Merges signatures from a PSBT signed elsewhere.
    ///
    /// The import must describe the same transaction and may only carry
    /// signatures from this wallet's cosigners; otherwise nothing is merged.
    pub fn import_signed_psbt(&mut self, encoded: &str) -> Result<ImportOutcome, SendError> {
        self.ensure_accepts_signatures()?;
        let incoming = deserialize_base64(encoded)?;

        for (index, input) in incoming.inputs.iter().enumerate() {
            let Some(live) = self.psbt.inputs.get(index) else {
                break;
            };
            let known: HashSet<PublicKey> = self
                .config
                .cosigners
                .iter()
                .filter_map(|c| cosigner_key(&self.secp, live, c))
                .map(PublicKey::new)
                .collect();
            if let Some(stranger) = input.partial_sigs.keys().find(|pk| !known.contains(pk)) {
                let err = SendError::PsbtInputMismatch(format!(
                    "input {} carries a signature from {}, which is not a cosigner key",
                    index, stranger
                ));
                warn!("rejected signed PSBT import: {}", err);
                return Err(err);
            }
        }

        let merged = import_signatures(&self.secp, &mut self.psbt, &incoming)?;
        let status = self.refresh_state();
        info!(
            "imported {} new signatures, {}/{} present",
            merged, status.present_sigs, status.required_sigs
        );
        Ok(if merged == 0 {
            ImportOutcome::NothingNew
        } else {
            ImportOutcome::Merged(merged)
        })
    }

    /// Finalizes the PSBT and extracts the network transaction.
    ///
    /// Fails with `InsufficientSignatures`, leaving the PSBT unmodified, unless
    /// every input holds at least `m` cosigner signatures.
    pub fn finalize(&mut self) -> Result<FinalizedTransaction, SendError> {
        self.ensure_accepts_signatures()?;
        let status = self.signature_status();
        if !status.can_finalize {
            return Err(SendError::InsufficientSignatures {
                present: status.present_sigs,
                required: status.required_sigs,
            });
        }
        match finalize_psbt(&self.secp, &mut self.psbt) {
            Ok(finalized) => {
                self.state = CoordinatorState::Finalized {
                    raw_tx_hex: finalized.raw_hex.clone(),
                    txid: finalized.txid,
                };
                Ok(finalized)
            }
            Err(e) => {
                self.state = CoordinatorState::Failed {
                    reason: e.to_string(),
                    raw_tx_hex: None,
                };
                Err(e)
            }
        }
    }

    /// Finalizes, then hands the raw transaction to `broadcaster`.
    pub async fn finalize_and_broadcast(
        &mut self,
        broadcaster: &dyn Broadcaster,
    ) -> Result<Txid, SendError> {
        let raw_tx_hex = match &self.state {
            CoordinatorState::Finalized { raw_tx_hex, .. } => raw_tx_hex.clone(),
            _ => self.finalize()?.raw_hex,
        };
        match broadcaster.broadcast(&raw_tx_hex).await {
            Ok(txid) => {
                info!("broadcast multisig transaction {}", txid);
                self.state = CoordinatorState::Broadcast { txid };
                Ok(txid)
            }
            Err(e) => {
                warn!("broadcast failed: {}", e);
                self.state = CoordinatorState::Failed {
                    reason: e.to_string(),
                    raw_tx_hex: Some(raw_tx_hex),
                };
                Err(e)
            }
        }
    }
}
