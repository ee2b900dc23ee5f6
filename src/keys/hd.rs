use std::str::FromStr;

use miniscript::bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use miniscript::bitcoin::secp256k1::{Secp256k1, Signing};
use miniscript::descriptor::DescriptorSecretKey;
use zeroize::Zeroizing;

use crate::error::SendError;
use crate::networks::Network;

/// HD key material rooted either at a master key or at an account key with a
/// known origin.
pub struct HdKey {
    root: Xpriv,
    origin: Option<(Fingerprint, DerivationPath)>,
}

fn key_error(context: &str, e: impl std::fmt::Display) -> SendError {
    SendError::KeyAccessFailure(format!("{}: {}", context, e))
}

impl HdKey {
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, SendError> {
        let root = Xpriv::new_master(network.to_bitcoin_network(), seed)
            .map_err(|e| key_error("invalid seed", e))?;
        Ok(HdKey { root, origin: None })
    }

    pub fn from_mnemonic(
        phrase: &str,
        passphrase: &str,
        network: Network,
    ) -> Result<Self, SendError> {
        let mnemonic = bip39::Mnemonic::parse_normalized(phrase)
            .map_err(|e| key_error("invalid mnemonic", e))?;
        let seed = Zeroizing::new(mnemonic.to_seed_normalized(passphrase));
        Self::from_seed(seed.as_slice(), network)
    }

    /// A bare extended private key is treated as the root of every path.
    pub fn from_xprv(xprv: &str) -> Result<Self, SendError> {
        let root = Xpriv::from_str(xprv.trim()).map_err(|e| key_error("invalid xprv", e))?;
        Ok(HdKey { root, origin: None })
    }

    /// Parses the key of a single-key descriptor such as
    /// `wpkh([d34db33f/84'/0'/0']xprv.../0/*)`.
    pub fn from_descriptor(descriptor: &str) -> Result<Self, SendError> {
        let body = descriptor.split('#').next().unwrap_or(descriptor);
        let start = body.rfind('(').map(|i| i + 1).unwrap_or(0);
        let rest = &body[start..];
        let end = rest.find([')', ',']).unwrap_or(rest.len());
        let key_expr = rest[..end].trim();

        match DescriptorSecretKey::from_str(key_expr) {
            Ok(DescriptorSecretKey::XPrv(xkey)) => Ok(HdKey {
                root: xkey.xkey,
                origin: xkey.origin,
            }),
            Ok(_) => Err(SendError::KeyAccessFailure(
                "descriptor does not hold a single extended private key".to_string(),
            )),
            Err(e) => Err(key_error("invalid descriptor key", e)),
        }
    }

    /// Fingerprint of the master key this material descends from.
    pub fn master_fingerprint<C: Signing>(&self, secp: &Secp256k1<C>) -> Fingerprint {
        match &self.origin {
            Some((fingerprint, _)) => *fingerprint,
            None => self.root.fingerprint(secp),
        }
    }

    pub fn xpub<C: Signing>(&self, secp: &Secp256k1<C>) -> Xpub {
        Xpub::from_priv(secp, &self.root)
    }

    /// Derives the key at `path`, given from the master key.
    pub fn derive<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        path: &DerivationPath,
    ) -> Result<Xpriv, SendError> {
        let relative: Vec<ChildNumber> = match &self.origin {
            Some((_, origin_path)) => {
                let prefix: &[ChildNumber] = origin_path.as_ref();
                let full: &[ChildNumber] = path.as_ref();
                full.strip_prefix(prefix)
                    .ok_or_else(|| {
                        SendError::KeyAccessFailure(format!(
                            "path {} is outside account {}",
                            path, origin_path
                        ))
                    })?
                    .to_vec()
            }
            None => path.as_ref().to_vec(),
        };
        self.root
            .derive_priv(secp, &relative)
            .map_err(|e| key_error("derivation failed", e))
    }

    pub(crate) fn erase(&mut self) {
        self.root.private_key.non_secure_erase();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_xpriv, ABANDON_MNEMONIC};

    fn path(s: &str) -> DerivationPath {
        DerivationPath::from_str(s).unwrap()
    }

    #[test]
    fn test_mnemonic_fingerprint() {
        // BIP84 reference vector master fingerprint
        let secp = Secp256k1::new();
        let key = HdKey::from_mnemonic(ABANDON_MNEMONIC, "", Network::Bitcoin).unwrap();
        assert_eq!(key.master_fingerprint(&secp).to_string(), "73c5da0a");
    }

    #[test]
    fn test_invalid_mnemonic() {
        let err = HdKey::from_mnemonic("abandon abandon", "", Network::Bitcoin).unwrap_err();
        assert!(matches!(err, SendError::KeyAccessFailure(_)));
    }

    #[test]
    fn test_descriptor_origin_matches_master() {
        let secp = Secp256k1::new();
        let master = HdKey {
            root: test_xpriv("descriptor"),
            origin: None,
        };
        let account_path = path("m/84'/1'/0'");
        let account = master.derive(&secp, &account_path).unwrap();
        let descriptor = format!(
            "wpkh([{}/84'/1'/0']{}/0/*)",
            master.master_fingerprint(&secp),
            account
        );
        let from_descriptor = HdKey::from_descriptor(&descriptor).unwrap();

        assert_eq!(
            from_descriptor.master_fingerprint(&secp),
            master.master_fingerprint(&secp)
        );
        let full = path("m/84'/1'/0'/0/5");
        assert_eq!(
            from_descriptor.derive(&secp, &full).unwrap().private_key,
            master.derive(&secp, &full).unwrap().private_key
        );
        assert!(from_descriptor.derive(&secp, &path("m/44'/1'/0'/0/5")).is_err());
    }

    #[test]
    fn test_descriptor_without_xprv() {
        let err = HdKey::from_descriptor(
            "wpkh(02f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9)",
        )
        .unwrap_err();
        assert!(matches!(err, SendError::KeyAccessFailure(_)));
    }

    #[test]
    fn test_erase() {
        let secp = Secp256k1::new();
        let mut key = HdKey::from_xprv(&test_xpriv("erase").to_string()).unwrap();
        let before = key.xpub(&secp);
        key.erase();
        assert_ne!(key.xpub(&secp), before);
    }
}
