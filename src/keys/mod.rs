//! Signing key abstraction over every wallet variant.
//!
//! [`KeySigner`] is a tagged union with a single capability,
//! [`KeySigner::sign_input`]: given where the key lives (a BIP32 path or the
//! one static key) and a sighash, return a signature. Derivation and tweak
//! math stay inside the variants.

pub mod hd;
pub mod imported;
pub mod taproot;

use miniscript::bitcoin::bip32::{DerivationPath, Fingerprint};
use miniscript::bitcoin::secp256k1::{self, Message, Secp256k1, SecretKey, Signing};
use miniscript::bitcoin::{
    ecdsa, taproot as bitcoin_taproot, EcdsaSighashType, PublicKey, TapNodeHash, TapSighashType,
    XOnlyPublicKey,
};
use zeroize::Zeroizing;

use crate::address::KeyAddressType;
use crate::error::SendError;
use crate::multisig::Cosigner;
use crate::networks::Network;

pub use hd::HdKey;
pub use imported::ImportedKey;

/// Decrypted key material handed over by the key vault.
///
/// Every secret is wrapped in [`Zeroizing`] and wiped when dropped.
#[derive(Clone)]
pub enum SecretMaterial {
    Mnemonic {
        phrase: Zeroizing<String>,
        passphrase: Zeroizing<String>,
    },
    Seed(Zeroizing<Vec<u8>>),
    Xprv(Zeroizing<String>),
    Descriptor(Zeroizing<String>),
    Wif {
        wif: Zeroizing<String>,
        address_type: KeyAddressType,
    },
}

impl SecretMaterial {
    pub fn mnemonic(phrase: impl Into<String>) -> Self {
        SecretMaterial::Mnemonic {
            phrase: Zeroizing::new(phrase.into()),
            passphrase: Zeroizing::new(String::new()),
        }
    }

    pub fn wif(wif: impl Into<String>, address_type: KeyAddressType) -> Self {
        SecretMaterial::Wif {
            wif: Zeroizing::new(wif.into()),
            address_type,
        }
    }
}

impl std::fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            SecretMaterial::Mnemonic { .. } => "Mnemonic",
            SecretMaterial::Seed(_) => "Seed",
            SecretMaterial::Xprv(_) => "Xprv",
            SecretMaterial::Descriptor(_) => "Descriptor",
            SecretMaterial::Wif { .. } => "Wif",
        };
        write!(f, "SecretMaterial::{}(..)", kind)
    }
}

/// Where the signing key for an input lives.
#[derive(Debug, Clone, Copy)]
pub enum KeyLocator<'a> {
    /// Path from the master key.
    Path(&'a DerivationPath),
    /// The single key of an imported wallet.
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningMode {
    Ecdsa(EcdsaSighashType),
    TaprootKeyPath {
        merkle_root: Option<TapNodeHash>,
        sighash_type: TapSighashType,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSignature {
    Ecdsa {
        pubkey: PublicKey,
        signature: ecdsa::Signature,
    },
    Schnorr {
        internal_key: XOnlyPublicKey,
        signature: bitcoin_taproot::Signature,
    },
}

fn hd_from_material(material: &SecretMaterial, network: Network) -> Result<HdKey, SendError> {
    match material {
        SecretMaterial::Mnemonic { phrase, passphrase } => {
            HdKey::from_mnemonic(phrase, passphrase, network)
        }
        SecretMaterial::Seed(seed) => HdKey::from_seed(seed, network),
        SecretMaterial::Xprv(xprv) => HdKey::from_xprv(xprv),
        SecretMaterial::Descriptor(descriptor) => HdKey::from_descriptor(descriptor),
        SecretMaterial::Wif { .. } => Err(SendError::KeyAccessFailure(
            "an imported key cannot act as an HD key".to_string(),
        )),
    }
}

/// HD key held on behalf of one multisig cosigner.
pub struct CosignerKey {
    pub name: String,
    key: HdKey,
}

pub enum KeySigner {
    Hd(HdKey),
    Imported(ImportedKey),
    Cosigner(CosignerKey),
    Destroyed,
}

impl KeySigner {
    pub fn from_material(material: &SecretMaterial, network: Network) -> Result<Self, SendError> {
        match material {
            SecretMaterial::Wif { wif, address_type } => Ok(KeySigner::Imported(
                ImportedKey::from_wif(wif, *address_type)?,
            )),
            _ => Ok(KeySigner::Hd(hd_from_material(material, network)?)),
        }
    }

    /// Binds HD material to a cosigner, failing unless the master
    /// fingerprints agree.
    pub fn for_cosigner<C: Signing>(
        secp: &Secp256k1<C>,
        material: &SecretMaterial,
        cosigner: &Cosigner,
        network: Network,
    ) -> Result<Self, SendError> {
        let key = hd_from_material(material, network)?;
        if key.master_fingerprint(secp) != cosigner.fingerprint {
            return Err(SendError::NoLocalKey {
                fingerprint: cosigner.fingerprint.to_string(),
            });
        }
        Ok(KeySigner::Cosigner(CosignerKey {
            name: cosigner.name.clone(),
            key,
        }))
    }

    fn hd(&self) -> Option<&HdKey> {
        match self {
            KeySigner::Hd(key) => Some(key),
            KeySigner::Cosigner(cosigner) => Some(&cosigner.key),
            _ => None,
        }
    }

    /// Master fingerprint of HD variants.
    pub fn fingerprint<C: Signing>(&self, secp: &Secp256k1<C>) -> Option<Fingerprint> {
        self.hd().map(|key| key.master_fingerprint(secp))
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, KeySigner::Destroyed)
    }

    fn erase(&mut self) {
        match self {
            KeySigner::Hd(key) => key.erase(),
            KeySigner::Cosigner(cosigner) => cosigner.key.erase(),
            KeySigner::Imported(key) => key.erase(),
            KeySigner::Destroyed => {}
        }
    }

    /// Wipes key material. Any later signing attempt fails.
    pub fn destroy(&mut self) {
        self.erase();
        *self = KeySigner::Destroyed;
    }

    fn with_secret<C: Signing, T>(
        &self,
        secp: &Secp256k1<C>,
        locator: KeyLocator<'_>,
        f: impl FnOnce(&SecretKey) -> Result<T, SendError>,
    ) -> Result<T, SendError> {
        match (self, locator) {
            (KeySigner::Destroyed, _) => Err(SendError::KeyAccessFailure(
                "signer has been destroyed".to_string(),
            )),
            (KeySigner::Imported(key), KeyLocator::Static) => f(key.secret_key()),
            (KeySigner::Imported(_), KeyLocator::Path(path)) => Err(SendError::KeyAccessFailure(
                format!("imported key cannot derive {}", path),
            )),
            (_, KeyLocator::Path(path)) => {
                let hd = self.hd().ok_or_else(|| {
                    SendError::KeyAccessFailure("signer holds no HD key".to_string())
                })?;
                let mut child = hd.derive(secp, path)?;
                let result = f(&child.private_key);
                child.private_key.non_secure_erase();
                result
            }
            (_, KeyLocator::Static) => Err(SendError::KeyAccessFailure(
                "HD signer needs a derivation path".to_string(),
            )),
        }
    }

    pub fn public_key<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        locator: KeyLocator<'_>,
    ) -> Result<secp256k1::PublicKey, SendError> {
        self.with_secret(secp, locator, |sk| {
            Ok(secp256k1::PublicKey::from_secret_key(secp, sk))
        })
    }

    /// Signs a sighash message with the key at `locator`.
    ///
    /// # Arguments
    /// * `locator` - BIP32 path for HD variants, `Static` for imported keys
    /// * `msg` - Sighash computed for the input
    /// * `mode` - ECDSA, or Schnorr over the BIP341-tweaked key
    pub fn sign_input<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        locator: KeyLocator<'_>,
        msg: &Message,
        mode: SigningMode,
    ) -> Result<InputSignature, SendError> {
        let compressed = match self {
            KeySigner::Imported(key) => key.is_compressed(),
            _ => true,
        };
        self.with_secret(secp, locator, |sk| match mode {
            SigningMode::Ecdsa(sighash_type) => Ok(InputSignature::Ecdsa {
                pubkey: PublicKey {
                    compressed,
                    inner: secp256k1::PublicKey::from_secret_key(secp, sk),
                },
                signature: ecdsa::Signature {
                    signature: secp.sign_ecdsa(msg, sk),
                    sighash_type,
                },
            }),
            SigningMode::TaprootKeyPath {
                merkle_root,
                sighash_type,
            } => {
                let tweaked = taproot::tweak_secret_key(secp, sk, merkle_root)?;
                Ok(InputSignature::Schnorr {
                    internal_key: tweaked.internal_key,
                    signature: bitcoin_taproot::Signature {
                        signature: secp.sign_schnorr_no_aux_rand(msg, &tweaked.keypair),
                        sighash_type,
                    },
                })
            }
        })
    }
}

impl Drop for KeySigner {
    fn drop(&mut self) {
        self.erase();
    }
}
