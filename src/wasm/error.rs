use wasm_bindgen::prelude::*;

use crate::error::SendError;

/// Error type for the JavaScript surface
///
/// Carries the rendered message and the [`crate::ErrorKind`] name so hosts can
/// branch without parsing text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmSpendError {
    kind: String,
    message: String,
}

impl WasmSpendError {
    pub fn new(message: &str) -> Self {
        WasmSpendError {
            kind: "Unknown".to_string(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for WasmSpendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WasmSpendError {}

impl From<SendError> for WasmSpendError {
    fn from(err: SendError) -> Self {
        WasmSpendError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<WasmSpendError> for JsValue {
    fn from(err: WasmSpendError) -> JsValue {
        let js_err = js_sys::Error::new(&err.message);
        js_err.set_name(&err.kind);
        js_err.into()
    }
}
