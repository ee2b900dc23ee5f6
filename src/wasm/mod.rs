//! JavaScript bindings.
//!
//! Thin wrappers that decode strings from the host, call into the engine and
//! convert results with [`try_into_js_value::TryIntoJsValue`].

mod error;
mod psbt;
mod try_into_js_value;

use wasm_bindgen::prelude::wasm_bindgen;
use wasm_bindgen::JsValue;

use crate::address::bip21::parse_payment_uri;
use crate::address::parse_address;
use crate::classify::{classify, humanize_broadcast_rejection};
use crate::networks::Network;
use try_into_js_value::TryIntoJsValue;

pub use error::WasmSpendError;
pub use psbt::WasmPsbtTools;

fn parse_network(network: &str) -> Result<Network, WasmSpendError> {
    network.parse().map_err(|e: String| WasmSpendError::new(&e))
}

#[wasm_bindgen]
pub struct WasmSpendUtils;

#[wasm_bindgen]
impl WasmSpendUtils {
    /// Sorts a raw failure message into `{ kind, level, message }`
    #[wasm_bindgen(js_name = classifyError)]
    pub fn classify_error(raw: &str) -> Result<JsValue, WasmSpendError> {
        classify(raw).try_to_js_value()
    }

    /// User-facing text for a node's broadcast rejection reason
    #[wasm_bindgen(js_name = humanizeBroadcastError)]
    pub fn humanize_broadcast_error(reason: &str) -> String {
        humanize_broadcast_rejection(reason).message()
    }

    #[wasm_bindgen(js_name = parsePaymentUri)]
    pub fn parse_payment_uri(uri: &str, network: &str) -> Result<JsValue, WasmSpendError> {
        parse_payment_uri(uri, parse_network(network)?)?.try_to_js_value()
    }

    #[wasm_bindgen(js_name = isValidAddress)]
    pub fn is_valid_address(address: &str, network: &str) -> Result<bool, WasmSpendError> {
        Ok(parse_address(address.trim(), parse_network(network)?).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;

    #[test]
    fn test_error_conversion_keeps_kind() {
        let err: WasmSpendError = SendError::NoChangeAddress.into();
        assert_eq!(err.kind(), "NoChangeAddress");
        assert_eq!(err.message(), SendError::NoChangeAddress.to_string());
    }

    #[test]
    fn test_is_valid_address() {
        let address = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
        assert!(WasmSpendUtils::is_valid_address(address, "bitcoin").unwrap());
        assert!(!WasmSpendUtils::is_valid_address(address, "testnet").unwrap());
        assert!(WasmSpendUtils::is_valid_address(address, "dogecoin").is_err());
    }
}
