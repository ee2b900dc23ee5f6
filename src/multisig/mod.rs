//! m-of-n multisig wallets: configuration, scripts and signature collection.

pub mod coordinator;
pub mod scripts;
pub mod status;

use std::collections::HashSet;
use std::str::FromStr;

use miniscript::bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpub};
use miniscript::bitcoin::secp256k1::{self, Secp256k1, Verification};
use miniscript::bitcoin::{Script, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::dimensions::InputScriptType;
use crate::error::SendError;
use crate::selection::SpendProfile;

pub use status::{compute_signature_status, CosignerStatus, SignatureStatus};

/// Largest cosigner set a standard `OP_CHECKMULTISIG` redeem script allows.
pub const MAX_COSIGNERS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MultisigScriptType {
    P2sh,
    P2shP2wsh,
    P2wsh,
}

impl MultisigScriptType {
    pub fn matches_output(&self, script_pubkey: &Script) -> bool {
        match self {
            MultisigScriptType::P2sh | MultisigScriptType::P2shP2wsh => script_pubkey.is_p2sh(),
            MultisigScriptType::P2wsh => script_pubkey.is_p2wsh(),
        }
    }

    pub fn input_script_type(&self, m: usize, n: usize) -> InputScriptType {
        match self {
            MultisigScriptType::P2sh => InputScriptType::P2shMultisig { m, n },
            MultisigScriptType::P2shP2wsh => InputScriptType::P2shP2wshMultisig { m, n },
            MultisigScriptType::P2wsh => InputScriptType::P2wshMultisig { m, n },
        }
    }

    /// Output script paying to the given multisig script.
    pub fn output_script(&self, multisig_script: &Script) -> ScriptBuf {
        match self {
            MultisigScriptType::P2sh => multisig_script.to_p2sh(),
            MultisigScriptType::P2shP2wsh => multisig_script.to_p2wsh().to_p2sh(),
            MultisigScriptType::P2wsh => multisig_script.to_p2wsh(),
        }
    }
}

impl FromStr for MultisigScriptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p2sh" => Ok(MultisigScriptType::P2sh),
            "p2shP2wsh" | "p2sh-p2wsh" => Ok(MultisigScriptType::P2shP2wsh),
            "p2wsh" => Ok(MultisigScriptType::P2wsh),
            _ => Err(format!("Unknown multisig script type: {}", s)),
        }
    }
}

/// One key holder of a multisig wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cosigner {
    pub name: String,
    pub fingerprint: Fingerprint,
    /// Account-level extended public key.
    pub xpub: Xpub,
    /// Path from the cosigner's master key to `xpub`.
    pub derivation_path: DerivationPath,
    /// Whether a seed for this cosigner is held on this device.
    pub is_local: bool,
}

impl Cosigner {
    pub fn full_path(&self, relative: &DerivationPath) -> DerivationPath {
        self.derivation_path.extend(relative)
    }

    /// Strips the account prefix from a path rooted at the master key.
    pub fn relative_path(&self, full: &DerivationPath) -> Option<DerivationPath> {
        let prefix: &[ChildNumber] = self.derivation_path.as_ref();
        let full: &[ChildNumber] = full.as_ref();
        full.strip_prefix(prefix)
            .map(|rest| DerivationPath::from(rest.to_vec()))
    }

    pub fn derive_pubkey<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        relative: &DerivationPath,
    ) -> Result<secp256k1::PublicKey, SendError> {
        self.xpub
            .derive_pub(secp, relative)
            .map(|xpub| xpub.public_key)
            .map_err(|e| {
                SendError::InvalidMultisigConfig(format!(
                    "cannot derive {} for cosigner {}: {}",
                    relative, self.name, e
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigConfig {
    pub m: usize,
    pub script_type: MultisigScriptType,
    pub cosigners: Vec<Cosigner>,
}

impl MultisigConfig {
    /// Creates a validated configuration.
    ///
    /// # Returns
    /// `InvalidMultisigConfig` unless `1 <= m <= n <= 15` and every cosigner
    /// fingerprint is unique
    pub fn new(
        m: usize,
        script_type: MultisigScriptType,
        cosigners: Vec<Cosigner>,
    ) -> Result<Self, SendError> {
        let config = MultisigConfig {
            m,
            script_type,
            cosigners,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SendError> {
        let n = self.n();
        if self.m == 0 || self.m > n {
            return Err(SendError::InvalidMultisigConfig(format!(
                "threshold {} is not within 1..={}",
                self.m, n
            )));
        }
        if n > MAX_COSIGNERS {
            return Err(SendError::InvalidMultisigConfig(format!(
                "{} cosigners exceeds the maximum of {}",
                n, MAX_COSIGNERS
            )));
        }
        let mut seen = HashSet::new();
        for cosigner in &self.cosigners {
            if !seen.insert(cosigner.fingerprint) {
                return Err(SendError::InvalidMultisigConfig(format!(
                    "duplicate cosigner fingerprint {}",
                    cosigner.fingerprint
                )));
            }
        }
        Ok(())
    }

    pub fn n(&self) -> usize {
        self.cosigners.len()
    }

    pub fn spend_profile(&self) -> SpendProfile {
        SpendProfile::Multisig {
            script_type: self.script_type,
            m: self.m,
            n: self.n(),
        }
    }

    pub fn cosigner(&self, fingerprint: Fingerprint) -> Option<&Cosigner> {
        self.cosigners.iter().find(|c| c.fingerprint == fingerprint)
    }

    pub fn local_cosigners(&self) -> impl Iterator<Item = &Cosigner> {
        self.cosigners.iter().filter(|c| c.is_local)
    }

    pub fn from_json(json: &str) -> Result<Self, SendError> {
        let dto: MultisigConfigJson = serde_json::from_str(json)
            .map_err(|e| SendError::InvalidMultisigConfig(e.to_string()))?;
        dto.try_into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CosignerJson {
    name: String,
    fingerprint: String,
    xpub: String,
    derivation_path: String,
    #[serde(default)]
    is_local: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultisigConfigJson {
    m: usize,
    script_type: MultisigScriptType,
    cosigners: Vec<CosignerJson>,
}

impl TryFrom<MultisigConfigJson> for MultisigConfig {
    type Error = SendError;

    fn try_from(dto: MultisigConfigJson) -> Result<Self, Self::Error> {
        let invalid = |field: &str, name: &str, e: String| {
            SendError::InvalidMultisigConfig(format!("{} of {}: {}", field, name, e))
        };
        let cosigners = dto
            .cosigners
            .into_iter()
            .map(|c| {
                Ok(Cosigner {
                    fingerprint: Fingerprint::from_str(&c.fingerprint)
                        .map_err(|e| invalid("fingerprint", &c.name, e.to_string()))?,
                    xpub: Xpub::from_str(&c.xpub)
                        .map_err(|e| invalid("xpub", &c.name, e.to_string()))?,
                    derivation_path: DerivationPath::from_str(&c.derivation_path)
                        .map_err(|e| invalid("derivation path", &c.name, e.to_string()))?,
                    is_local: c.is_local,
                    name: c.name,
                })
            })
            .collect::<Result<Vec<_>, SendError>>()?;
        MultisigConfig::new(dto.m, dto.script_type, cosigners)
    }
}
