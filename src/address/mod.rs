//! Address parsing and script conversion for a configured network.

pub mod bip21;

use std::str::FromStr;

use miniscript::bitcoin::{Address, Script, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::error::SendError;
use crate::networks::Network;

/// Output script families the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputScriptType {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
}

impl OutputScriptType {
    pub fn from_script(script: &Script) -> Option<Self> {
        if script.is_p2pkh() {
            Some(OutputScriptType::P2pkh)
        } else if script.is_p2sh() {
            Some(OutputScriptType::P2sh)
        } else if script.is_p2wpkh() {
            Some(OutputScriptType::P2wpkh)
        } else if script.is_p2wsh() {
            Some(OutputScriptType::P2wsh)
        } else if script.is_p2tr() {
            Some(OutputScriptType::P2tr)
        } else {
            None
        }
    }

    pub fn is_segwit(&self) -> bool {
        matches!(
            self,
            OutputScriptType::P2wpkh | OutputScriptType::P2wsh | OutputScriptType::P2tr
        )
    }
}

/// Address types a single key can be spent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAddressType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
    P2tr,
}

impl KeyAddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAddressType::P2pkh => "p2pkh",
            KeyAddressType::P2shP2wpkh => "p2sh-p2wpkh",
            KeyAddressType::P2wpkh => "p2wpkh",
            KeyAddressType::P2tr => "p2tr",
        }
    }
}

impl FromStr for KeyAddressType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p2pkh" | "legacy" => Ok(KeyAddressType::P2pkh),
            "p2sh-p2wpkh" | "p2shp2wpkh" | "wrapped-segwit" => Ok(KeyAddressType::P2shP2wpkh),
            "p2wpkh" | "segwit" | "native-segwit" => Ok(KeyAddressType::P2wpkh),
            "p2tr" | "taproot" => Ok(KeyAddressType::P2tr),
            _ => Err(format!("Unknown address type: {}", s)),
        }
    }
}

/// Parses an address and checks it belongs to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address, SendError> {
    let invalid = |reason: String| SendError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    let unchecked = Address::from_str(address.trim()).map_err(|e| invalid(e.to_string()))?;
    unchecked
        .require_network(network.to_bitcoin_network())
        .map_err(|_| invalid(format!("not a {} address", network)))
}

pub fn to_output_script(address: &str, network: Network) -> Result<ScriptBuf, SendError> {
    Ok(parse_address(address, network)?.script_pubkey())
}

pub fn from_output_script(script: &Script, network: Network) -> Result<String, SendError> {
    Address::from_script(script, network.to_bitcoin_network())
        .map(|a| a.to_string())
        .map_err(|e| SendError::InvalidAddress {
            address: script.to_hex_string(),
            reason: e.to_string(),
        })
}
