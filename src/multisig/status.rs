use miniscript::bitcoin::bip32::Fingerprint;
use miniscript::bitcoin::psbt::{self, Psbt};
use miniscript::bitcoin::secp256k1::{self, Secp256k1, Verification};
use miniscript::bitcoin::PublicKey;
use serde::Serialize;
use tracing::warn;

use super::{Cosigner, MultisigConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CosignerStatus {
    pub name: String,
    pub fingerprint: String,
    /// True once this cosigner has signed every input.
    pub has_signed: bool,
    pub is_local: bool,
    pub signed_inputs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub required_sigs: usize,
    /// Signatures on the least-signed input.
    pub present_sigs: usize,
    pub cosigners: Vec<CosignerStatus>,
    pub can_finalize: bool,
}

impl SignatureStatus {
    pub fn missing_sigs(&self) -> usize {
        self.required_sigs.saturating_sub(self.present_sigs)
    }

    pub fn has_signed(&self, fingerprint: Fingerprint) -> bool {
        let fingerprint = fingerprint.to_string();
        self.cosigners
            .iter()
            .any(|c| c.has_signed && c.fingerprint == fingerprint)
    }
}

/// The key `cosigner` signs `input` with, taken from the input's BIP32
/// derivations and checked against the cosigner's xpub.
pub fn cosigner_key<C: Verification>(
    secp: &Secp256k1<C>,
    input: &psbt::Input,
    cosigner: &Cosigner,
) -> Option<secp256k1::PublicKey> {
    let (pk, (_, path)) = input
        .bip32_derivation
        .iter()
        .find(|(_, (fp, _))| *fp == cosigner.fingerprint)?;
    let relative = cosigner.relative_path(path)?;
    match cosigner.derive_pubkey(secp, &relative) {
        Ok(derived) if derived == *pk => Some(*pk),
        _ => {
            warn!(
                "key {} for cosigner {} does not derive from its xpub",
                pk, cosigner.name
            );
            None
        }
    }
}

fn has_signature(input: &psbt::Input, pk: secp256k1::PublicKey) -> bool {
    input.partial_sigs.contains_key(&PublicKey::new(pk))
}

/// Counts signatures per input and per cosigner.
///
/// A signature only counts when its key maps to a configured cosigner; the
/// transaction is only as signed as its least-signed input.
pub fn compute_signature_status<C: Verification>(
    secp: &Secp256k1<C>,
    psbt: &Psbt,
    config: &MultisigConfig,
) -> SignatureStatus {
    let mut signed_inputs = vec![0usize; config.n()];
    let mut present_sigs: Option<usize> = None;

    for input in &psbt.inputs {
        let mut count = 0;
        for (i, cosigner) in config.cosigners.iter().enumerate() {
            if let Some(pk) = cosigner_key(secp, input, cosigner) {
                if has_signature(input, pk) {
                    signed_inputs[i] += 1;
                    count += 1;
                }
            }
        }
        present_sigs = Some(present_sigs.map_or(count, |p| p.min(count)));
    }

    let present_sigs = present_sigs.unwrap_or(0);
    let input_count = psbt.inputs.len();
    let cosigners = config
        .cosigners
        .iter()
        .zip(signed_inputs)
        .map(|(c, signed)| CosignerStatus {
            name: c.name.clone(),
            fingerprint: c.fingerprint.to_string(),
            has_signed: input_count > 0 && signed == input_count,
            is_local: c.is_local,
            signed_inputs: signed,
        })
        .collect();

    SignatureStatus {
        required_sigs: config.m,
        present_sigs,
        cosigners,
        can_finalize: input_count > 0 && present_sigs >= config.m,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multisig::MultisigScriptType;
    use crate::test_utils::{multisig_psbt, test_multisig_config};
    use miniscript::bitcoin::secp256k1::{Message, SecretKey};
    use miniscript::bitcoin::{ecdsa, EcdsaSighashType};

    fn dummy_signature() -> ecdsa::Signature {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[3u8; 32]).unwrap();
        ecdsa::Signature {
            signature: secp.sign_ecdsa(&Message::from_digest([5u8; 32]), &sk),
            sighash_type: EcdsaSighashType::All,
        }
    }

    fn mark_signed(psbt: &mut Psbt, config: &MultisigConfig, cosigner: usize, input: usize) {
        let secp = Secp256k1::verification_only();
        let pk = cosigner_key(&secp, &psbt.inputs[input], &config.cosigners[cosigner]).unwrap();
        psbt.inputs[input]
            .partial_sigs
            .insert(PublicKey::new(pk), dummy_signature());
    }

    #[test]
    fn test_unsigned_status() {
        let secp = Secp256k1::verification_only();
        let config = test_multisig_config(2, MultisigScriptType::P2wsh);
        let psbt = multisig_psbt(&config, &[40_000]);
        let status = compute_signature_status(&secp, &psbt, &config);
        assert_eq!(status.required_sigs, 2);
        assert_eq!(status.present_sigs, 0);
        assert_eq!(status.missing_sigs(), 2);
        assert!(!status.can_finalize);
        assert_eq!(status.cosigners.len(), 3);
    }

    #[test]
    fn test_least_signed_input_wins() {
        let secp = Secp256k1::verification_only();
        let config = test_multisig_config(2, MultisigScriptType::P2wsh);
        let mut psbt = multisig_psbt(&config, &[40_000, 30_000]);
        mark_signed(&mut psbt, &config, 0, 0);
        mark_signed(&mut psbt, &config, 1, 0);
        mark_signed(&mut psbt, &config, 0, 1);

        let status = compute_signature_status(&secp, &psbt, &config);
        assert_eq!(status.present_sigs, 1);
        assert!(!status.can_finalize);
        assert!(status.cosigners[0].has_signed);
        assert!(!status.cosigners[1].has_signed);
        assert_eq!(status.cosigners[1].signed_inputs, 1);

        mark_signed(&mut psbt, &config, 2, 1);
        let status = compute_signature_status(&secp, &psbt, &config);
        assert_eq!(status.present_sigs, 2);
        assert!(status.can_finalize);
        assert!(status.has_signed(config.cosigners[2].fingerprint));
    }

    #[test]
    fn test_signature_from_unknown_key_is_ignored() {
        let secp = Secp256k1::new();
        let config = test_multisig_config(2, MultisigScriptType::P2shP2wsh);
        let mut psbt = multisig_psbt(&config, &[40_000]);
        let stranger = SecretKey::from_slice(&[9u8; 32]).unwrap().public_key(&secp);
        psbt.inputs[0]
            .partial_sigs
            .insert(PublicKey::new(stranger), dummy_signature());
        let status = compute_signature_status(&secp, &psbt, &config);
        assert_eq!(status.present_sigs, 0);
    }

    #[test]
    fn test_forged_derivation_is_not_counted() {
        let secp = Secp256k1::new();
        let config = test_multisig_config(2, MultisigScriptType::P2wsh);
        let mut psbt = multisig_psbt(&config, &[40_000]);
        // point cosigner 0's derivation at a key it does not own
        let stranger = SecretKey::from_slice(&[9u8; 32]).unwrap().public_key(&secp);
        let (pk, origin) = psbt.inputs[0]
            .bip32_derivation
            .iter()
            .find(|(_, (fp, _))| *fp == config.cosigners[0].fingerprint)
            .map(|(pk, origin)| (*pk, origin.clone()))
            .unwrap();
        psbt.inputs[0].bip32_derivation.remove(&pk);
        psbt.inputs[0].bip32_derivation.insert(stranger, origin);
        psbt.inputs[0]
            .partial_sigs
            .insert(PublicKey::new(stranger), dummy_signature());

        let status = compute_signature_status(&secp, &psbt, &config);
        assert_eq!(status.cosigners[0].signed_inputs, 0);
    }
}
