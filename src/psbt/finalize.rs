use miniscript::bitcoin::consensus::encode::serialize_hex;
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::secp256k1::{Secp256k1, Verification};
use miniscript::bitcoin::{Transaction, Txid};
use miniscript::psbt::PsbtExt;

use crate::error::SendError;

/// A fully signed transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTransaction {
    pub tx: Transaction,
    pub raw_hex: String,
    pub txid: Txid,
}

/// Finalizes every input and extracts the network transaction.
///
/// Runs on a copy; `psbt` only receives the finalized fields once extraction
/// succeeded.
pub fn finalize_psbt<C: Verification>(
    secp: &Secp256k1<C>,
    psbt: &mut Psbt,
) -> Result<FinalizedTransaction, SendError> {
    let mut working = psbt.clone();
    working.finalize_mut(secp).map_err(|errors| {
        let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        SendError::FinalizeFailed(reasons.join("; "))
    })?;
    let tx = working
        .clone()
        .extract_tx()
        .map_err(|e| SendError::FinalizeFailed(e.to_string()))?;
    *psbt = working;
    Ok(FinalizedTransaction {
        raw_hex: serialize_hex(&tx),
        txid: tx.compute_txid(),
        tx,
    })
}

pub fn is_finalized(psbt: &Psbt) -> bool {
    psbt.inputs
        .iter()
        .all(|i| i.final_script_sig.is_some() || i.final_script_witness.is_some())
}
