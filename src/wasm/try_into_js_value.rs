use js_sys::Array;
use wasm_bindgen::JsValue;

use super::error::WasmSpendError;
use crate::address::bip21::PaymentUri;
use crate::classify::Classification;
use crate::multisig::coordinator::CoordinatorState;
use crate::multisig::status::{CosignerStatus, SignatureStatus};
use crate::psbt::finalize::FinalizedTransaction;

pub(crate) trait TryIntoJsValue {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError>;
}

macro_rules! js_obj {
    ( $( $key:expr => $value:expr ),* ) => {{
        let obj = js_sys::Object::new();
        $(
            js_sys::Reflect::set(&obj, &$key.into(), &$value.try_to_js_value()?.into())
                .map_err(|_| WasmSpendError::new("Failed to set object property"))?;
        )*
        Ok(Into::<JsValue>::into(obj)) as Result<JsValue, WasmSpendError>
    }};
}

impl TryIntoJsValue for String {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        Ok(JsValue::from_str(self))
    }
}

impl TryIntoJsValue for &str {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        Ok(JsValue::from_str(self))
    }
}

impl TryIntoJsValue for bool {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        Ok(JsValue::from_bool(*self))
    }
}

impl TryIntoJsValue for usize {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        Ok(JsValue::from_f64(*self as f64))
    }
}

impl TryIntoJsValue for u64 {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        Ok(js_sys::BigInt::from(*self).into())
    }
}

impl<T: TryIntoJsValue> TryIntoJsValue for Vec<T> {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        let arr = Array::new();
        for item in self.iter() {
            arr.push(&item.try_to_js_value()?);
        }
        Ok(arr.into())
    }
}

impl<T: TryIntoJsValue> TryIntoJsValue for Option<T> {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        match self {
            Some(v) => v.try_to_js_value(),
            None => Ok(JsValue::NULL),
        }
    }
}

impl TryIntoJsValue for CosignerStatus {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        js_obj!(
            "name" => self.name,
            "fingerprint" => self.fingerprint,
            "hasSigned" => self.has_signed,
            "isLocal" => self.is_local,
            "signedInputs" => self.signed_inputs
        )
    }
}

impl TryIntoJsValue for SignatureStatus {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        js_obj!(
            "requiredSigs" => self.required_sigs,
            "presentSigs" => self.present_sigs,
            "cosigners" => self.cosigners,
            "canFinalize" => self.can_finalize
        )
    }
}

impl TryIntoJsValue for Classification {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        js_obj!(
            "kind" => self.kind.to_string(),
            "level" => self.level.as_str(),
            "message" => self.message
        )
    }
}

impl TryIntoJsValue for PaymentUri {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        js_obj!(
            "address" => self.address,
            "amountSats" => self.amount_sats,
            "label" => self.label,
            "message" => self.message
        )
    }
}

impl TryIntoJsValue for FinalizedTransaction {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        js_obj!(
            "txid" => self.txid.to_string(),
            "rawTxHex" => self.raw_hex
        )
    }
}

impl TryIntoJsValue for CoordinatorState {
    fn try_to_js_value(&self) -> Result<JsValue, WasmSpendError> {
        match self {
            CoordinatorState::Finalized { raw_tx_hex, txid } => js_obj!(
                "state" => self.as_str(),
                "txid" => txid.to_string(),
                "rawTxHex" => raw_tx_hex
            ),
            CoordinatorState::Broadcast { txid } => js_obj!(
                "state" => self.as_str(),
                "txid" => txid.to_string()
            ),
            CoordinatorState::Failed { reason, raw_tx_hex } => js_obj!(
                "state" => self.as_str(),
                "reason" => reason,
                "rawTxHex" => raw_tx_hex
            ),
            _ => js_obj!("state" => self.as_str()),
        }
    }
}
