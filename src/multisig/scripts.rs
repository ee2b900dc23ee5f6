//! Multisig script construction and PSBT decoration.

use miniscript::bitcoin::bip32::DerivationPath;
use miniscript::bitcoin::opcodes::all::OP_CHECKMULTISIG;
use miniscript::bitcoin::psbt::{self, Psbt};
use miniscript::bitcoin::script::Builder;
use miniscript::bitcoin::secp256k1::{self, Secp256k1, Verification};
use miniscript::bitcoin::{Address, PublicKey, ScriptBuf, TxOut};

use super::{Cosigner, MultisigConfig, MultisigScriptType};
use crate::error::SendError;
use crate::networks::Network;
use crate::psbt::spent_output;

impl MultisigConfig {
    /// Cosigner keys at `relative`, sorted lexicographically (BIP67).
    pub fn sorted_pubkeys<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        relative: &DerivationPath,
    ) -> Result<Vec<(secp256k1::PublicKey, &Cosigner)>, SendError> {
        let mut keys = self
            .cosigners
            .iter()
            .map(|c| Ok((c.derive_pubkey(secp, relative)?, c)))
            .collect::<Result<Vec<_>, SendError>>()?;
        keys.sort_by_key(|(pk, _)| pk.serialize());
        Ok(keys)
    }

    /// `OP_m <sorted pubkeys> OP_n OP_CHECKMULTISIG`
    pub fn multisig_script<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        relative: &DerivationPath,
    ) -> Result<ScriptBuf, SendError> {
        let keys = self.sorted_pubkeys(secp, relative)?;
        let builder = keys
            .iter()
            .fold(Builder::new().push_int(self.m as i64), |b, (pk, _)| {
                b.push_key(&PublicKey::new(*pk))
            });
        Ok(builder
            .push_int(keys.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script())
    }

    pub fn output_script<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        relative: &DerivationPath,
    ) -> Result<ScriptBuf, SendError> {
        Ok(self
            .script_type
            .output_script(&self.multisig_script(secp, relative)?))
    }

    pub fn address<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        relative: &DerivationPath,
        network: Network,
    ) -> Result<Address, SendError> {
        let script = self.output_script(secp, relative)?;
        Address::from_script(&script, network.to_bitcoin_network()).map_err(|e| {
            SendError::InvalidMultisigConfig(format!("cannot encode address: {}", e))
        })
    }

    /// Sets scripts and every cosigner's BIP32 derivation on one input.
    ///
    /// Fails if the scripts derived at `relative` do not pay to `spent`.
    pub fn prepare_psbt_input<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        input: &mut psbt::Input,
        spent: &TxOut,
        relative: &DerivationPath,
    ) -> Result<(), SendError> {
        let script = self.multisig_script(secp, relative)?;
        if self.script_type.output_script(&script) != spent.script_pubkey {
            return Err(SendError::InvalidMultisigConfig(format!(
                "cosigner keys at {} do not match output script {}",
                relative,
                spent.script_pubkey.to_hex_string()
            )));
        }

        match self.script_type {
            MultisigScriptType::P2sh => {
                input.redeem_script = Some(script);
            }
            MultisigScriptType::P2shP2wsh => {
                input.redeem_script = Some(script.to_p2wsh());
                input.witness_script = Some(script);
            }
            MultisigScriptType::P2wsh => {
                input.witness_script = Some(script);
            }
        }

        for (pk, cosigner) in self.sorted_pubkeys(secp, relative)? {
            input
                .bip32_derivation
                .insert(pk, (cosigner.fingerprint, cosigner.full_path(relative)));
        }
        Ok(())
    }

    pub fn prepare_psbt<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        psbt: &mut Psbt,
        relative_paths: &[DerivationPath],
    ) -> Result<(), SendError> {
        if relative_paths.len() != psbt.inputs.len() {
            return Err(SendError::InvalidState(format!(
                "{} derivation paths for {} inputs",
                relative_paths.len(),
                psbt.inputs.len()
            )));
        }
        for (index, relative) in relative_paths.iter().enumerate() {
            let spent = spent_output(psbt, index)?;
            self.prepare_psbt_input(secp, &mut psbt.inputs[index], &spent, relative)?;
        }
        Ok(())
    }

    /// Decorates a change output so cosigners can verify it returns to the wallet.
    pub fn prepare_psbt_output<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        output: &mut psbt::Output,
        relative: &DerivationPath,
    ) -> Result<(), SendError> {
        let script = self.multisig_script(secp, relative)?;
        match self.script_type {
            MultisigScriptType::P2sh => output.redeem_script = Some(script),
            MultisigScriptType::P2shP2wsh => {
                output.redeem_script = Some(script.to_p2wsh());
                output.witness_script = Some(script);
            }
            MultisigScriptType::P2wsh => output.witness_script = Some(script),
        }
        for (pk, cosigner) in self.sorted_pubkeys(secp, relative)? {
            output
                .bip32_derivation
                .insert(pk, (cosigner.fingerprint, cosigner.full_path(relative)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_multisig_config;
    use miniscript::bitcoin::Amount;
    use rstest::rstest;
    use std::str::FromStr;

    fn path(s: &str) -> DerivationPath {
        DerivationPath::from_str(s).unwrap()
    }

    #[test]
    fn test_script_is_sorted_multi() {
        let secp = Secp256k1::verification_only();
        let config = test_multisig_config(2, MultisigScriptType::P2wsh);
        let script = config.multisig_script(&secp, &path("m/0/3")).unwrap();
        // OP_2 + 3 * (push + 33) + OP_3 + OP_CHECKMULTISIG
        assert_eq!(script.len(), 105);
        assert_eq!(script.as_bytes()[0], 0x52);
        assert_eq!(script.as_bytes()[103], 0x53);
        assert_eq!(script.as_bytes()[104], 0xae);

        let keys = config.sorted_pubkeys(&secp, &path("m/0/3")).unwrap();
        let serialized: Vec<_> = keys.iter().map(|(pk, _)| pk.serialize()).collect();
        let mut sorted = serialized.clone();
        sorted.sort();
        assert_eq!(serialized, sorted);
    }

    #[test]
    fn test_different_indexes_give_different_scripts() {
        let secp = Secp256k1::verification_only();
        let config = test_multisig_config(2, MultisigScriptType::P2wsh);
        assert_ne!(
            config.output_script(&secp, &path("m/0/0")).unwrap(),
            config.output_script(&secp, &path("m/0/1")).unwrap()
        );
    }

    #[rstest]
    #[case(MultisigScriptType::P2sh, Network::Bitcoin, "3")]
    #[case(MultisigScriptType::P2shP2wsh, Network::Bitcoin, "3")]
    #[case(MultisigScriptType::P2wsh, Network::Bitcoin, "bc1q")]
    #[case(MultisigScriptType::P2wsh, Network::Testnet, "tb1q")]
    fn test_address_prefix(
        #[case] script_type: MultisigScriptType,
        #[case] network: Network,
        #[case] prefix: &str,
    ) {
        let secp = Secp256k1::verification_only();
        let config = test_multisig_config(2, script_type);
        let address = config.address(&secp, &path("m/0/0"), network).unwrap();
        assert!(address.to_string().starts_with(prefix), "{}", address);
    }

    #[test]
    fn test_prepare_input_sets_derivations() {
        let secp = Secp256k1::verification_only();
        let config = test_multisig_config(2, MultisigScriptType::P2shP2wsh);
        let relative = path("m/1/4");
        let spent = TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: config.output_script(&secp, &relative).unwrap(),
        };
        let mut input = psbt::Input::default();
        config
            .prepare_psbt_input(&secp, &mut input, &spent, &relative)
            .unwrap();

        assert!(input.witness_script.is_some());
        assert!(input.redeem_script.as_ref().unwrap().is_p2wsh());
        assert_eq!(input.bip32_derivation.len(), 3);
        for cosigner in &config.cosigners {
            assert!(input
                .bip32_derivation
                .values()
                .any(|(fp, p)| *fp == cosigner.fingerprint && *p == cosigner.full_path(&relative)));
        }
    }

    #[test]
    fn test_prepare_input_rejects_wrong_path() {
        let secp = Secp256k1::verification_only();
        let config = test_multisig_config(2, MultisigScriptType::P2wsh);
        let spent = TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: config.output_script(&secp, &path("m/0/0")).unwrap(),
        };
        let mut input = psbt::Input::default();
        let err = config
            .prepare_psbt_input(&secp, &mut input, &spent, &path("m/0/1"))
            .unwrap_err();
        assert!(matches!(err, SendError::InvalidMultisigConfig(_)));
        assert!(input.bip32_derivation.is_empty());
    }
}
