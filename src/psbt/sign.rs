//! Input signing for single-key wallets, plus the sighash helpers the
//! multisig coordinator shares.

use std::borrow::Borrow;
use std::collections::HashMap;

use miniscript::bitcoin::bip32::{DerivationPath, Fingerprint};
use miniscript::bitcoin::hashes::Hash;
use miniscript::bitcoin::psbt::{self, Psbt};
use miniscript::bitcoin::secp256k1::{Message, Secp256k1, Signing, Verification};
use miniscript::bitcoin::sighash::{Prevouts, SighashCache};
use miniscript::bitcoin::{
    CompressedPublicKey, EcdsaSighashType, ScriptBuf, TapNodeHash, TapSighashType, Transaction,
    TxOut,
};
use tracing::debug;

use super::{input_address, prevouts};
use crate::address::OutputScriptType;
use crate::error::SendError;
use crate::keys::{InputSignature, KeyLocator, KeySigner, SigningMode};
use crate::networks::Network;

/// Address of each wallet output mapped to its path from the master key.
pub type AddressPaths = HashMap<String, DerivationPath>;

pub fn ecdsa_sighash<T: Borrow<Transaction>>(
    psbt: &Psbt,
    index: usize,
    cache: &mut SighashCache<T>,
) -> Result<(Message, EcdsaSighashType), SendError> {
    psbt.sighash_ecdsa(index, cache)
        .map_err(|e| SendError::Signing(format!("sighash for input {}: {}", index, e)))
}

pub fn taproot_sighash_type(input: &psbt::Input) -> Result<TapSighashType, SendError> {
    match input.sighash_type {
        None => Ok(TapSighashType::Default),
        Some(ty) => ty
            .taproot_hash_ty()
            .map_err(|e| SendError::Signing(format!("invalid taproot sighash type: {}", e))),
    }
}

pub fn taproot_key_sighash<T: Borrow<Transaction>>(
    index: usize,
    prevouts: &[TxOut],
    sighash_type: TapSighashType,
    cache: &mut SighashCache<T>,
) -> Result<Message, SendError> {
    let sighash = cache
        .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), sighash_type)
        .map_err(|e| SendError::Signing(format!("taproot sighash for input {}: {}", index, e)))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Stores a signature on the input together with the key's origin.
pub(crate) fn apply_signature(
    input: &mut psbt::Input,
    signature: InputSignature,
    origin: Option<(Fingerprint, DerivationPath)>,
) {
    match signature {
        InputSignature::Ecdsa { pubkey, signature } => {
            input.partial_sigs.insert(pubkey, signature);
            if let Some(origin) = origin {
                input.bip32_derivation.entry(pubkey.inner).or_insert(origin);
            }
        }
        InputSignature::Schnorr {
            internal_key,
            signature,
        } => {
            input.tap_internal_key = Some(internal_key);
            input.tap_key_sig = Some(signature);
            if let Some(origin) = origin {
                input
                    .tap_key_origins
                    .entry(internal_key)
                    .or_insert((vec![], origin));
            }
        }
    }
}

/// Whether the key behind `signature` is the one `script_pubkey` pays to.
fn signature_controls_output<C: Verification>(
    secp: &Secp256k1<C>,
    signature: &InputSignature,
    merkle_root: Option<TapNodeHash>,
    script_pubkey: &ScriptBuf,
) -> bool {
    match signature {
        InputSignature::Ecdsa { pubkey, .. } if script_pubkey.is_p2pkh() => {
            ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) == *script_pubkey
        }
        InputSignature::Ecdsa { pubkey, .. } => pubkey
            .wpubkey_hash()
            .map(|hash| ScriptBuf::new_p2wpkh(&hash) == *script_pubkey)
            .unwrap_or(false),
        InputSignature::Schnorr { internal_key, .. } => {
            ScriptBuf::new_p2tr(secp, *internal_key, merkle_root) == *script_pubkey
        }
    }
}

/// Signs every input of a single-key PSBT.
///
/// Paths are looked up by the address each input spends; imported keys sign
/// every input with their one key. The PSBT is only updated when every input
/// signed, so a failure leaves it exactly as it was.
///
/// # Returns
/// Number of inputs signed
pub fn sign_single_key<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    psbt: &mut Psbt,
    signer: &KeySigner,
    paths: &AddressPaths,
    network: Network,
) -> Result<usize, SendError> {
    let mut working = psbt.clone();
    let prevouts = prevouts(&working)?;
    let fingerprint = signer.fingerprint(secp);
    let unsigned_tx = working.unsigned_tx.clone();
    let mut cache = SighashCache::new(&unsigned_tx);

    for (index, spent) in prevouts.iter().enumerate() {
        let path = match signer {
            KeySigner::Imported(_) => None,
            _ => {
                let address = input_address(&working, index, network)?;
                match paths.get(&address) {
                    Some(path) => Some(path.clone()),
                    None => return Err(SendError::DerivationPathMissing { address }),
                }
            }
        };
        let locator = path
            .as_ref()
            .map(KeyLocator::Path)
            .unwrap_or(KeyLocator::Static);

        let script_type = OutputScriptType::from_script(&spent.script_pubkey).ok_or_else(|| {
            SendError::Signing(format!("input {} has an unsupported script", index))
        })?;
        let signature = match script_type {
            OutputScriptType::P2tr => {
                let sighash_type = taproot_sighash_type(&working.inputs[index])?;
                let msg = taproot_key_sighash(index, &prevouts, sighash_type, &mut cache)?;
                signer.sign_input(
                    secp,
                    locator,
                    &msg,
                    SigningMode::TaprootKeyPath {
                        merkle_root: working.inputs[index].tap_merkle_root,
                        sighash_type,
                    },
                )?
            }
            OutputScriptType::P2sh => {
                // single-key P2SH is always P2SH-P2WPKH
                let pubkey = CompressedPublicKey(signer.public_key(secp, locator)?);
                let redeem_script = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
                if redeem_script.to_p2sh() != spent.script_pubkey {
                    return Err(SendError::KeyAccessFailure(format!(
                        "key does not control input {}",
                        index
                    )));
                }
                working.inputs[index].redeem_script = Some(redeem_script);
                let (msg, sighash_type) = ecdsa_sighash(&working, index, &mut cache)?;
                signer.sign_input(secp, locator, &msg, SigningMode::Ecdsa(sighash_type))?
            }
            OutputScriptType::P2pkh | OutputScriptType::P2wpkh => {
                let (msg, sighash_type) = ecdsa_sighash(&working, index, &mut cache)?;
                signer.sign_input(secp, locator, &msg, SigningMode::Ecdsa(sighash_type))?
            }
            OutputScriptType::P2wsh => {
                return Err(SendError::Signing(format!(
                    "input {} is a script-hash output, sign it through the multisig coordinator",
                    index
                )))
            }
        };
        if script_type != OutputScriptType::P2sh
            && !signature_controls_output(
                secp,
                &signature,
                working.inputs[index].tap_merkle_root,
                &spent.script_pubkey,
            )
        {
            return Err(SendError::KeyAccessFailure(format!(
                "key does not control input {}",
                index
            )));
        }
        let origin = fingerprint.zip(path);
        apply_signature(&mut working.inputs[index], signature, origin);
    }

    let signed = working.inputs.len();
    *psbt = working;
    debug!("signed {} inputs", signed);
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::KeyAddressType;
    use crate::keys::SecretMaterial;
    use crate::psbt::finalize::finalize_psbt;
    use crate::test_utils::{funding_tx, unsigned_psbt, ABANDON_MNEMONIC};
    use miniscript::bitcoin::Address;
    use rstest::rstest;
    use std::str::FromStr;

    const WIF: &str = "KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn";
    const WIF_UNCOMPRESSED: &str = "5HpHagT65TZzG1PH3CSu63k8DbpvD8s5ip4nEB3kEsreAnchuDf";

    fn hd_signer() -> KeySigner {
        KeySigner::from_material(&SecretMaterial::mnemonic(ABANDON_MNEMONIC), Network::Bitcoin)
            .unwrap()
    }

    fn script_for(address: &str) -> ScriptBuf {
        Address::from_str(address)
            .unwrap()
            .assume_checked()
            .script_pubkey()
    }

    #[test]
    fn test_sign_hd_p2wpkh() {
        let secp = Secp256k1::new();
        let address = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
        let mut psbt = unsigned_psbt(&[(script_for(address), 50_000)], &[49_000]);
        let mut paths = AddressPaths::new();
        paths.insert(
            address.to_string(),
            DerivationPath::from_str("m/84'/0'/0'/0/0").unwrap(),
        );

        let signed =
            sign_single_key(&secp, &mut psbt, &hd_signer(), &paths, Network::Bitcoin).unwrap();
        assert_eq!(signed, 1);
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);
        let (fingerprint, _) = psbt.inputs[0].bip32_derivation.values().next().unwrap();
        assert_eq!(fingerprint.to_string(), "73c5da0a");

        let finalized = finalize_psbt(&secp, &mut psbt).unwrap();
        assert_eq!(finalized.tx.input[0].witness.len(), 2);
    }

    #[test]
    fn test_missing_path_leaves_psbt_untouched() {
        let secp = Secp256k1::new();
        let address = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
        let mut psbt = unsigned_psbt(&[(script_for(address), 50_000)], &[49_000]);
        let before = psbt.clone();

        let err = sign_single_key(
            &secp,
            &mut psbt,
            &hd_signer(),
            &AddressPaths::new(),
            Network::Bitcoin,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SendError::DerivationPathMissing {
                address: address.to_string()
            }
        );
        assert_eq!(psbt, before);
    }

    #[test]
    fn test_sign_imported_taproot() {
        let secp = Secp256k1::new();
        let material = SecretMaterial::wif(WIF, KeyAddressType::P2tr);
        let signer = KeySigner::from_material(&material, Network::Bitcoin).unwrap();
        let KeySigner::Imported(key) = &signer else {
            panic!("expected imported signer");
        };
        let script = key.script_pubkey(&secp, Network::Bitcoin).unwrap();
        let mut psbt = unsigned_psbt(&[(script.clone(), 30_000), (script, 20_000)], &[49_000]);

        sign_single_key(
            &secp,
            &mut psbt,
            &signer,
            &AddressPaths::new(),
            Network::Bitcoin,
        )
        .unwrap();
        assert!(psbt.inputs.iter().all(|i| i.tap_key_sig.is_some()));

        let finalized = finalize_psbt(&secp, &mut psbt).unwrap();
        for input in &finalized.tx.input {
            assert_eq!(input.witness.len(), 1);
            assert_eq!(input.witness.nth(0).unwrap().len(), 64);
        }
    }

    #[test]
    fn test_sign_imported_p2sh_p2wpkh() {
        let secp = Secp256k1::new();
        let signer = KeySigner::from_material(
            &SecretMaterial::wif(WIF, KeyAddressType::P2shP2wpkh),
            Network::Bitcoin,
        )
        .unwrap();
        let script = script_for("3JvL6Ymt8MVWiCNHC7oWU6nLeHNJKLZGLN");
        let mut psbt = unsigned_psbt(&[(script, 30_000)], &[29_000]);

        sign_single_key(&secp, &mut psbt, &signer, &AddressPaths::new(), Network::Bitcoin)
            .unwrap();
        assert!(psbt.inputs[0].redeem_script.is_some());

        let finalized = finalize_psbt(&secp, &mut psbt).unwrap();
        assert!(!finalized.tx.input[0].script_sig.is_empty());
        assert_eq!(finalized.tx.input[0].witness.len(), 2);
    }

    #[test]
    fn test_sign_uncompressed_p2pkh() {
        let secp = Secp256k1::new();
        let signer = KeySigner::from_material(
            &SecretMaterial::wif(WIF_UNCOMPRESSED, KeyAddressType::P2pkh),
            Network::Bitcoin,
        )
        .unwrap();
        let script = script_for("1EHNa6Q4Jz2uvNExL497mE43ikXhwF6kZm");
        let mut psbt = unsigned_psbt(&[(script.clone(), 30_000)], &[29_000]);
        psbt.inputs[0].witness_utxo = None;
        psbt.inputs[0].non_witness_utxo = Some(funding_tx(&[(script, 30_000)], 0));

        sign_single_key(&secp, &mut psbt, &signer, &AddressPaths::new(), Network::Bitcoin)
            .unwrap();
        let pubkey = psbt.inputs[0].partial_sigs.keys().next().unwrap();
        assert!(!pubkey.compressed);

        let finalized = finalize_psbt(&secp, &mut psbt).unwrap();
        assert!(finalized.tx.input[0].witness.is_empty());
        assert!(!finalized.tx.input[0].script_sig.is_empty());
    }

    #[rstest]
    #[case::p2wpkh(KeyAddressType::P2wpkh, "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu")]
    #[case::p2pkh(KeyAddressType::P2pkh, "1EHNa6Q4Jz2uvNExL497mE43ikXhwF6kZm")]
    #[case::p2tr(
        KeyAddressType::P2tr,
        "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr"
    )]
    fn test_wrong_key_for_single_key_input(
        #[case] address_type: KeyAddressType,
        #[case] foreign_address: &str,
    ) {
        let secp = Secp256k1::new();
        let signer =
            KeySigner::from_material(&SecretMaterial::wif(WIF, address_type), Network::Bitcoin)
                .unwrap();
        let mut psbt = unsigned_psbt(&[(script_for(foreign_address), 30_000)], &[29_000]);
        if address_type == KeyAddressType::P2pkh {
            let spent = psbt.inputs[0].witness_utxo.take().unwrap();
            psbt.inputs[0].non_witness_utxo =
                Some(funding_tx(&[(spent.script_pubkey, 30_000)], 0));
        }
        let before = psbt.clone();
        let err =
            sign_single_key(&secp, &mut psbt, &signer, &AddressPaths::new(), Network::Bitcoin)
                .unwrap_err();
        assert!(matches!(err, SendError::KeyAccessFailure(_)));
        assert_eq!(psbt, before);
    }

    #[test]
    fn test_wrong_key_for_wrapped_segwit() {
        let secp = Secp256k1::new();
        let signer = KeySigner::from_material(
            &SecretMaterial::wif(WIF, KeyAddressType::P2shP2wpkh),
            Network::Bitcoin,
        )
        .unwrap();
        // P2SH output that is not this key's wrapped P2WPKH
        let script = ScriptBuf::from_bytes(vec![0x51]).to_p2sh();
        let mut psbt = unsigned_psbt(&[(script, 30_000)], &[29_000]);
        let before = psbt.clone();
        let err =
            sign_single_key(&secp, &mut psbt, &signer, &AddressPaths::new(), Network::Bitcoin)
                .unwrap_err();
        assert!(matches!(err, SendError::KeyAccessFailure(_)));
        assert_eq!(psbt, before);
    }
}
