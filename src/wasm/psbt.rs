use miniscript::bitcoin::secp256k1::Secp256k1;
use wasm_bindgen::prelude::wasm_bindgen;
use wasm_bindgen::JsValue;

use super::error::WasmSpendError;
use super::parse_network;
use super::try_into_js_value::TryIntoJsValue;
use crate::error::SendError;
use crate::multisig::coordinator::MultisigCoordinator;
use crate::multisig::{compute_signature_status, MultisigConfig};
use crate::psbt::finalize::finalize_psbt;
use crate::psbt::merge::import_signatures;
use crate::psbt::{deserialize_base64, serialize_base64, sum_input_values, sum_output_values};

fn load_coordinator(
    psbt_base64: &str,
    config_json: &str,
    network: &str,
) -> Result<MultisigCoordinator, WasmSpendError> {
    let config = MultisigConfig::from_json(config_json)?;
    Ok(MultisigCoordinator::from_base64(
        psbt_base64,
        config,
        parse_network(network)?,
    )?)
}

/// Stateless PSBT helpers for hosts that keep the PSBT themselves
#[wasm_bindgen]
pub struct WasmPsbtTools;

#[wasm_bindgen]
impl WasmPsbtTools {
    /// Who has signed a multisig PSBT
    ///
    /// # Arguments
    /// * `psbt_base64` - The PSBT
    /// * `config_json` - Multisig configuration, `{ m, scriptType, cosigners }`
    #[wasm_bindgen(js_name = signatureStatus)]
    pub fn signature_status(
        psbt_base64: &str,
        config_json: &str,
    ) -> Result<JsValue, WasmSpendError> {
        let psbt = deserialize_base64(psbt_base64)?;
        let config = MultisigConfig::from_json(config_json)?;
        compute_signature_status(&Secp256k1::verification_only(), &psbt, &config)
            .try_to_js_value()
    }

    /// Copies verified signatures from `incoming` into `live`
    ///
    /// # Returns
    /// The merged PSBT as base64. `live` is returned unchanged when nothing was new.
    #[wasm_bindgen(js_name = mergeSignatures)]
    pub fn merge_signatures(live: &str, incoming: &str) -> Result<String, WasmSpendError> {
        let mut psbt = deserialize_base64(live)?;
        let other = deserialize_base64(incoming)?;
        import_signatures(&Secp256k1::verification_only(), &mut psbt, &other)?;
        Ok(serialize_base64(&psbt))
    }

    /// Imports a cosigner's PSBT after checking every signature belongs to the wallet
    #[wasm_bindgen(js_name = importCosignerPsbt)]
    pub fn import_cosigner_psbt(
        live: &str,
        incoming: &str,
        config_json: &str,
        network: &str,
    ) -> Result<String, WasmSpendError> {
        let mut coordinator = load_coordinator(live, config_json, network)?;
        coordinator.import_signed_psbt(incoming)?;
        Ok(coordinator.export_base64())
    }

    /// Where a multisig PSBT stands in signature collection
    ///
    /// # Returns
    /// `{ state }`, where state is `collecting` or `readyToFinalize`
    #[wasm_bindgen(js_name = coordinatorState)]
    pub fn coordinator_state(
        psbt_base64: &str,
        config_json: &str,
        network: &str,
    ) -> Result<JsValue, WasmSpendError> {
        load_coordinator(psbt_base64, config_json, network)?
            .state()
            .try_to_js_value()
    }

    /// Finalizes every input and extracts the network transaction
    ///
    /// # Returns
    /// `{ txid, rawTxHex }`
    #[wasm_bindgen(js_name = finalize)]
    pub fn finalize(psbt_base64: &str) -> Result<JsValue, WasmSpendError> {
        let mut psbt = deserialize_base64(psbt_base64)?;
        finalize_psbt(&Secp256k1::verification_only(), &mut psbt)?.try_to_js_value()
    }

    /// Fee paid by the PSBT in satoshis
    #[wasm_bindgen(js_name = fee)]
    pub fn fee(psbt_base64: &str) -> Result<u64, WasmSpendError> {
        let psbt = deserialize_base64(psbt_base64)?;
        let inputs = sum_input_values(&psbt)?;
        inputs
            .checked_sub(sum_output_values(&psbt))
            .ok_or_else(|| SendError::InvalidPsbt("outputs exceed inputs".to_string()).into())
    }
}
