//! Merging signatures from an externally signed copy of a PSBT.
//!
//! An import is all-or-nothing: the incoming PSBT must describe the same
//! transaction, and every signature it adds must verify, or nothing is merged.

use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::secp256k1::{Message, Secp256k1, Verification};
use miniscript::bitcoin::sighash::SighashCache;
use miniscript::bitcoin::XOnlyPublicKey;
use tracing::{debug, warn};

use super::prevouts;
use super::sign::{ecdsa_sighash, taproot_key_sighash};
use crate::error::SendError;

/// Rejects `incoming` unless it spends the same outpoints in the same order
/// and pays the same outputs as `live`.
pub fn check_same_transaction(live: &Psbt, incoming: &Psbt) -> Result<(), SendError> {
    let ours = &live.unsigned_tx;
    let theirs = &incoming.unsigned_tx;
    if ours.input.len() != theirs.input.len() || live.inputs.len() != incoming.inputs.len() {
        return Err(SendError::PsbtInputMismatch(format!(
            "expected {} inputs, imported PSBT has {}",
            ours.input.len(),
            theirs.input.len()
        )));
    }
    for (index, (a, b)) in ours.input.iter().zip(&theirs.input).enumerate() {
        if a.previous_output != b.previous_output {
            return Err(SendError::PsbtInputMismatch(format!(
                "input {} spends {} but imported PSBT spends {}",
                index, a.previous_output, b.previous_output
            )));
        }
    }
    if ours.output != theirs.output {
        return Err(SendError::PsbtInputMismatch(
            "imported PSBT pays different outputs".to_string(),
        ));
    }
    if ours.version != theirs.version || ours.lock_time != theirs.lock_time {
        return Err(SendError::PsbtInputMismatch(
            "imported PSBT has a different version or lock time".to_string(),
        ));
    }
    Ok(())
}

fn invalid_signature(index: usize, what: impl std::fmt::Display) -> SendError {
    SendError::PsbtInputMismatch(format!("invalid signature on input {}: {}", index, what))
}

/// Merges signatures from `incoming` that `live` does not hold yet.
///
/// Scripts and BIP32 derivations missing from `live` are copied over too.
///
/// # Returns
/// Number of newly merged signatures; zero when `incoming` adds nothing
pub fn merge_signatures<C: Verification>(
    secp: &Secp256k1<C>,
    live: &mut Psbt,
    incoming: &Psbt,
) -> Result<usize, SendError> {
    check_same_transaction(live, incoming)?;

    let mut working = live.clone();
    for (ours, theirs) in working.inputs.iter_mut().zip(&incoming.inputs) {
        if ours.witness_script.is_none() {
            ours.witness_script = theirs.witness_script.clone();
        }
        if ours.redeem_script.is_none() {
            ours.redeem_script = theirs.redeem_script.clone();
        }
        if ours.witness_utxo.is_none() {
            ours.witness_utxo = theirs.witness_utxo.clone();
        }
        if ours.non_witness_utxo.is_none() {
            ours.non_witness_utxo = theirs.non_witness_utxo.clone();
        }
        for (pk, origin) in &theirs.bip32_derivation {
            ours.bip32_derivation.entry(*pk).or_insert_with(|| origin.clone());
        }
        for (pk, origin) in &theirs.tap_key_origins {
            ours.tap_key_origins.entry(*pk).or_insert_with(|| origin.clone());
        }
    }

    let unsigned_tx = working.unsigned_tx.clone();
    let mut cache = SighashCache::new(&unsigned_tx);
    let mut merged = 0;

    for (index, theirs) in incoming.inputs.iter().enumerate() {
        let new_sigs: Vec<_> = theirs
            .partial_sigs
            .iter()
            .filter(|(pk, _)| !working.inputs[index].partial_sigs.contains_key(pk))
            .collect();
        if !new_sigs.is_empty() {
            let (msg, sighash_type) = ecdsa_sighash(&working, index, &mut cache)?;
            for (pk, sig) in new_sigs {
                if sig.sighash_type != sighash_type {
                    return Err(invalid_signature(index, "unexpected sighash type"));
                }
                secp.verify_ecdsa(&msg, &sig.signature, &pk.inner)
                    .map_err(|e| invalid_signature(index, e))?;
                working.inputs[index].partial_sigs.insert(*pk, *sig);
                merged += 1;
            }
        }

        if let (Some(sig), None) = (theirs.tap_key_sig, working.inputs[index].tap_key_sig) {
            let prevouts = prevouts(&working)?;
            let spk = &prevouts[index].script_pubkey;
            if !spk.is_p2tr() {
                return Err(invalid_signature(index, "key-path signature on non-taproot input"));
            }
            let output_key = XOnlyPublicKey::from_slice(&spk.as_bytes()[2..])
                .map_err(|e| invalid_signature(index, e))?;
            let msg: Message =
                taproot_key_sighash(index, &prevouts, sig.sighash_type, &mut cache)?;
            secp.verify_schnorr(&sig.signature, &msg, &output_key)
                .map_err(|e| invalid_signature(index, e))?;
            working.inputs[index].tap_key_sig = Some(sig);
            if working.inputs[index].tap_internal_key.is_none() {
                working.inputs[index].tap_internal_key = theirs.tap_internal_key;
            }
            merged += 1;
        }
    }

    *live = working;
    debug!("merged {} new signatures", merged);
    Ok(merged)
}

/// Like [`merge_signatures`], logging a rejected import.
pub fn import_signatures<C: Verification>(
    secp: &Secp256k1<C>,
    live: &mut Psbt,
    incoming: &Psbt,
) -> Result<usize, SendError> {
    merge_signatures(secp, live, incoming).inspect_err(|e| {
        warn!("rejected signed PSBT import: {}", e);
    })
}
