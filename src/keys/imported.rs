//! A single imported WIF key and the addresses it controls.

use miniscript::bitcoin::secp256k1::{self, Secp256k1, Signing, Verification};
use miniscript::bitcoin::{
    Address, CompressedPublicKey, NetworkKind, PrivateKey, PublicKey, ScriptBuf,
};

use crate::address::KeyAddressType;
use crate::error::SendError;
use crate::networks::Network;

pub struct ImportedKey {
    key: PrivateKey,
    address_type: KeyAddressType,
}

impl ImportedKey {
    /// Only P2PKH can spend from an uncompressed key.
    pub fn from_wif(wif: &str, address_type: KeyAddressType) -> Result<Self, SendError> {
        let key = PrivateKey::from_wif(wif.trim())
            .map_err(|e| SendError::KeyAccessFailure(format!("invalid WIF: {}", e)))?;
        if !key.compressed && address_type != KeyAddressType::P2pkh {
            return Err(SendError::KeyAccessFailure(format!(
                "uncompressed key cannot be used for {}",
                address_type.as_str()
            )));
        }
        Ok(ImportedKey { key, address_type })
    }

    pub fn address_type(&self) -> KeyAddressType {
        self.address_type
    }

    pub fn is_compressed(&self) -> bool {
        self.key.compressed
    }

    pub fn secret_key(&self) -> &secp256k1::SecretKey {
        &self.key.inner
    }

    pub fn public_key<C: Signing>(&self, secp: &Secp256k1<C>) -> PublicKey {
        self.key.public_key(secp)
    }

    fn compressed<C: Signing>(&self, secp: &Secp256k1<C>) -> Result<CompressedPublicKey, SendError> {
        CompressedPublicKey::from_private_key(secp, &self.key)
            .map_err(|e| SendError::KeyAccessFailure(e.to_string()))
    }

    /// The address this key receives on for its configured type.
    pub fn address<C: Signing + Verification>(
        &self,
        secp: &Secp256k1<C>,
        network: Network,
    ) -> Result<Address, SendError> {
        let kind = NetworkKind::from(network.to_bitcoin_network());
        if kind != self.key.network {
            return Err(SendError::KeyAccessFailure(format!(
                "key is not for {}",
                network
            )));
        }
        let btc_network = network.to_bitcoin_network();
        Ok(match self.address_type {
            KeyAddressType::P2pkh => Address::p2pkh(self.public_key(secp).pubkey_hash(), kind),
            KeyAddressType::P2shP2wpkh => Address::p2shwpkh(&self.compressed(secp)?, kind),
            KeyAddressType::P2wpkh => Address::p2wpkh(&self.compressed(secp)?, btc_network),
            KeyAddressType::P2tr => {
                let (internal, _) = self.key.inner.x_only_public_key(secp);
                Address::p2tr(secp, internal, None, btc_network)
            }
        })
    }

    pub fn script_pubkey<C: Signing + Verification>(
        &self,
        secp: &Secp256k1<C>,
        network: Network,
    ) -> Result<ScriptBuf, SendError> {
        Ok(self.address(secp, network)?.script_pubkey())
    }

    pub(crate) fn erase(&mut self) {
        self.key.inner.non_secure_erase();
    }
}
