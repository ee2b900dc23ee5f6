//! PSBT wire format and per-input helpers.

pub mod finalize;
pub mod merge;
pub mod sign;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::{Address, TxOut};

use crate::error::SendError;
use crate::networks::Network;

pub fn serialize_base64(psbt: &Psbt) -> String {
    BASE64_STANDARD.encode(psbt.serialize())
}

pub fn deserialize_base64(encoded: &str) -> Result<Psbt, SendError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| SendError::InvalidPsbt(format!("invalid base64: {}", e)))?;
    Psbt::deserialize(&bytes).map_err(|e| SendError::InvalidPsbt(e.to_string()))
}

/// The output spent by input `index`.
///
/// Prefers `witness_utxo`; falls back to the output of `non_witness_utxo`,
/// which must match the outpoint the unsigned transaction references.
pub fn spent_output(psbt: &Psbt, index: usize) -> Result<TxOut, SendError> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or_else(|| SendError::InvalidPsbt(format!("no input at index {}", index)))?;
    if let Some(txout) = &input.witness_utxo {
        return Ok(txout.clone());
    }
    let prevout = psbt
        .unsigned_tx
        .input
        .get(index)
        .map(|txin| txin.previous_output)
        .ok_or_else(|| SendError::InvalidPsbt(format!("no transaction input at index {}", index)))?;
    match &input.non_witness_utxo {
        Some(tx) if tx.compute_txid() == prevout.txid => tx
            .output
            .get(prevout.vout as usize)
            .cloned()
            .ok_or_else(|| {
                SendError::InvalidPsbt(format!("previous transaction has no output {}", prevout))
            }),
        Some(_) => Err(SendError::InvalidPsbt(format!(
            "previous transaction at input {} does not match {}",
            index, prevout.txid
        ))),
        None => Err(SendError::InvalidPsbt(format!(
            "input {} is missing its previous output",
            index
        ))),
    }
}

/// Spent outputs for every input, as needed by taproot sighashes.
pub fn prevouts(psbt: &Psbt) -> Result<Vec<TxOut>, SendError> {
    (0..psbt.inputs.len())
        .map(|i| spent_output(psbt, i))
        .collect()
}

pub fn input_address(psbt: &Psbt, index: usize, network: Network) -> Result<String, SendError> {
    let spent = spent_output(psbt, index)?;
    Address::from_script(&spent.script_pubkey, network.to_bitcoin_network())
        .map(|a| a.to_string())
        .map_err(|e| SendError::InvalidPsbt(format!("input {}: {}", index, e)))
}

/// Sum of spent output values.
pub fn sum_input_values(psbt: &Psbt) -> Result<u64, SendError> {
    prevouts(psbt)?.iter().try_fold(0u64, |acc, txout| {
        acc.checked_add(txout.value.to_sat())
            .ok_or_else(|| SendError::InvalidPsbt("input value overflow".to_string()))
    })
}

pub fn sum_output_values(psbt: &Psbt) -> u64 {
    psbt.unsigned_tx
        .output
        .iter()
        .map(|o| o.value.to_sat())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{funding_tx, test_p2wpkh_script, unsigned_psbt};
    use miniscript::bitcoin::Amount;

    #[test]
    fn test_base64_roundtrip() {
        let psbt = unsigned_psbt(&[(test_p2wpkh_script(1), 20_000)], &[19_000]);
        let encoded = serialize_base64(&psbt);
        assert!(encoded.starts_with("cHNidP8"));
        assert_eq!(deserialize_base64(&encoded).unwrap(), psbt);
    }

    #[test]
    fn test_invalid_base64() {
        assert!(matches!(
            deserialize_base64("not base64!"),
            Err(SendError::InvalidPsbt(_))
        ));
        assert!(matches!(
            deserialize_base64("aGVsbG8="),
            Err(SendError::InvalidPsbt(_))
        ));
    }

    #[test]
    fn test_spent_output_from_non_witness_utxo() {
        let mut psbt = unsigned_psbt(&[(test_p2wpkh_script(1), 20_000)], &[19_000]);
        let witness_utxo = psbt.inputs[0].witness_utxo.take().unwrap();
        let prev = funding_tx(&[(test_p2wpkh_script(1), 20_000)], 0);
        psbt.inputs[0].non_witness_utxo = Some(prev);
        assert_eq!(spent_output(&psbt, 0).unwrap(), witness_utxo);
        assert_eq!(sum_input_values(&psbt).unwrap(), 20_000);
        assert_eq!(sum_output_values(&psbt), 19_000);
    }

    #[test]
    fn test_spent_output_rejects_wrong_previous_tx() {
        let mut psbt = unsigned_psbt(&[(test_p2wpkh_script(1), 20_000)], &[19_000]);
        psbt.inputs[0].witness_utxo = None;
        psbt.inputs[0].non_witness_utxo =
            Some(funding_tx(&[(test_p2wpkh_script(1), 21_000)], 0));
        assert!(spent_output(&psbt, 0).is_err());
    }

    #[test]
    fn test_missing_previous_output() {
        let mut psbt = unsigned_psbt(&[(test_p2wpkh_script(1), 20_000)], &[19_000]);
        psbt.inputs[0].witness_utxo = None;
        assert!(spent_output(&psbt, 0).is_err());
        assert_eq!(
            Amount::from_sat(19_000),
            psbt.unsigned_tx.output[0].value
        );
    }
}
