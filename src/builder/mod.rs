//! Unsigned transaction construction.
//!
//! Building happens in two steps. [`TransactionBuilder::plan`] validates
//! recipients, selects inputs and settles fee and change. It is pure and
//! fails before anything is built. [`TransactionBuilder::to_psbt`] then turns
//! a plan into a PSBT carrying everything a signer needs.

use miniscript::bitcoin::absolute::LockTime;
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use miniscript::bitcoin::transaction::Version;
use miniscript::bitcoin::{
    Amount, FeeRate, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use tracing::debug;

use crate::address::{parse_address, to_output_script};
use crate::config::EngineConfig;
use crate::dimensions::InputScriptType;
use crate::error::SendError;
use crate::multisig::MultisigConfig;
use crate::policy::effective_fee_rate;
use crate::policy::enrichment::decode_previous_transaction;
use crate::psbt::serialize_base64;
use crate::psbt::sign::AddressPaths;
use crate::selection::{FeeContext, SelectedInputs, SelectionMode, SpendProfile, UtxoSelector};
use crate::types::{Recipient, Utxo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOutput {
    pub address: String,
    pub script_pubkey: ScriptBuf,
    pub amount: u64,
    pub label: Option<String>,
    pub is_change: bool,
}

impl PlannedOutput {
    fn txout(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.amount),
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// Inputs, outputs and fee of a transaction before it becomes a PSBT.
///
/// Always balanced: inputs pay exactly the outputs plus the fee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionPlan {
    pub inputs: Vec<Utxo>,
    pub input_types: Vec<InputScriptType>,
    /// Recipients in request order, change last.
    pub outputs: Vec<PlannedOutput>,
    pub fee: u64,
    pub vsize: u64,
    pub fee_rate: FeeRate,
    pub rbf: bool,
}

impl TransactionPlan {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|u| u.value).sum()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    pub fn change(&self) -> Option<&PlannedOutput> {
        self.outputs.iter().find(|o| o.is_change)
    }

    pub fn is_balanced(&self) -> bool {
        self.output_total().checked_add(self.fee) == Some(self.input_total())
    }

    pub fn needs_previous_transactions(&self) -> bool {
        self.input_types
            .iter()
            .any(InputScriptType::requires_previous_transaction)
    }

    fn sequence(&self) -> Sequence {
        if self.rbf {
            Sequence::ENABLE_RBF_NO_LOCKTIME
        } else {
            Sequence::ENABLE_LOCKTIME_NO_RBF
        }
    }

    pub fn unsigned_transaction(&self) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|u| TxIn {
                    previous_output: u.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: self.sequence(),
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs.iter().map(PlannedOutput::txout).collect(),
        }
    }
}

/// An unsigned PSBT and the plan it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltTransaction {
    pub psbt: Psbt,
    pub plan: TransactionPlan,
}

impl BuiltTransaction {
    pub fn fee(&self) -> u64 {
        self.plan.fee
    }

    pub fn vsize(&self) -> u64 {
        self.plan.vsize
    }

    pub fn psbt_base64(&self) -> String {
        serialize_base64(&self.psbt)
    }
}

struct ValidRecipient {
    recipient: Recipient,
    script_pubkey: ScriptBuf,
}

pub struct TransactionBuilder {
    config: EngineConfig,
    multisig: Option<MultisigConfig>,
    coin_control: Option<Vec<OutPoint>>,
    secp: Secp256k1<VerifyOnly>,
}

impl TransactionBuilder {
    pub fn new(config: EngineConfig) -> Self {
        TransactionBuilder {
            config,
            multisig: None,
            coin_control: None,
            secp: Secp256k1::verification_only(),
        }
    }

    pub fn multisig(config: EngineConfig, multisig: MultisigConfig) -> Self {
        TransactionBuilder {
            multisig: Some(multisig),
            ..Self::new(config)
        }
    }

    /// Spends exactly these outputs instead of selecting automatically.
    pub fn with_coin_control(mut self, outpoints: Vec<OutPoint>) -> Self {
        self.coin_control = Some(outpoints);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn selector(&self) -> UtxoSelector {
        UtxoSelector::new(match &self.multisig {
            Some(m) => m.spend_profile(),
            None => SpendProfile::SingleKey,
        })
    }

    /// Drops empty rows, then checks every remaining recipient.
    fn validate_recipients(
        &self,
        recipients: &[Recipient],
        check_dust: bool,
    ) -> Result<Vec<ValidRecipient>, SendError> {
        let valid = recipients
            .iter()
            .filter(|r| !r.address.trim().is_empty() && (!check_dust || r.amount > 0))
            .map(|r| {
                let address = parse_address(r.address.trim(), self.config.network)?;
                if check_dust && r.amount < self.config.dust_threshold_sats {
                    return Err(SendError::DustOutput {
                        amount: r.amount,
                        threshold: self.config.dust_threshold_sats,
                    });
                }
                Ok(ValidRecipient {
                    recipient: r.clone(),
                    script_pubkey: address.script_pubkey(),
                })
            })
            .collect::<Result<Vec<_>, SendError>>()?;
        if valid.is_empty() {
            return Err(SendError::NoValidRecipients);
        }
        Ok(valid)
    }

    fn select(
        &self,
        utxos: &[Utxo],
        target: u64,
        ctx: &FeeContext<'_>,
        mode: &SelectionMode,
    ) -> Result<SelectedInputs, SendError> {
        let selector = self.selector();
        let selected = selector.select(utxos, target, ctx, mode)?;
        let effective = effective_fee_rate(ctx.fee_rate, &selected.utxos, &self.config);
        if effective == ctx.fee_rate {
            return Ok(selected);
        }
        let raised = FeeContext {
            fee_rate: effective,
            ..ctx.clone()
        };
        selector.select(utxos, target, &raised, mode)
    }

    /// Selects inputs and settles fee and change for `recipients`.
    ///
    /// With `send_max`, the last recipient receives everything left after the
    /// other recipients and the fee; no change output is created.
    ///
    /// # Arguments
    /// * `recipients` - Outputs to pay; empty rows are ignored
    /// * `utxos` - Wallet outputs available for spending
    /// * `change_address` - Required whenever change clears the dust threshold
    /// * `fee_rate` - Requested rate, raised to the RBF floor for unconfirmed inputs
    /// * `send_max` - Sweep the eligible (or coin-controlled) outputs
    pub fn plan(
        &self,
        recipients: &[Recipient],
        utxos: &[Utxo],
        change_address: Option<&str>,
        fee_rate: FeeRate,
        send_max: bool,
    ) -> Result<TransactionPlan, SendError> {
        let valid = if send_max {
            let (last, fixed) = recipients
                .split_last()
                .ok_or(SendError::NoValidRecipients)?;
            let mut valid = if fixed.iter().all(Recipient::is_empty) {
                Vec::new()
            } else {
                self.validate_recipients(fixed, true)?
            };
            valid.extend(self.validate_recipients(std::slice::from_ref(last), false)?);
            valid
        } else {
            self.validate_recipients(recipients, true)?
        };

        let change_script = change_address
            .map(|a| to_output_script(a.trim(), self.config.network))
            .transpose()?;
        let recipient_scripts: Vec<ScriptBuf> =
            valid.iter().map(|v| v.script_pubkey.clone()).collect();
        let fixed = if send_max {
            &valid[..valid.len() - 1]
        } else {
            &valid[..]
        };
        let target = fixed.iter().try_fold(0u64, |acc, v| {
            acc.checked_add(v.recipient.amount)
                .ok_or_else(|| SendError::InvalidState("recipient amounts overflow".to_string()))
        })?;

        let mode = match (send_max, &self.coin_control) {
            (true, coin_control) => SelectionMode::SendMax {
                coin_control: coin_control.clone(),
            },
            (false, Some(outpoints)) => SelectionMode::Manual(outpoints.clone()),
            (false, None) => SelectionMode::Auto,
        };
        let ctx = FeeContext {
            fee_rate,
            recipient_scripts: &recipient_scripts,
            change_script: if send_max {
                None
            } else {
                change_script.as_deref()
            },
            dust_threshold: self.config.dust_threshold_sats,
        };
        let selected = self.select(utxos, target, &ctx, &mode)?;
        let fee_rate = effective_fee_rate(fee_rate, &selected.utxos, &self.config);

        let count = valid.len();
        let mut outputs: Vec<PlannedOutput> = valid
            .into_iter()
            .enumerate()
            .map(|(i, v)| PlannedOutput {
                amount: match selected.send_max_amount {
                    Some(max) if i + 1 == count => max,
                    _ => v.recipient.amount,
                },
                address: v.recipient.address.trim().to_string(),
                script_pubkey: v.script_pubkey,
                label: v.recipient.label,
                is_change: false,
            })
            .collect();
        if selected.has_change() {
            let (Some(address), Some(script)) = (change_address, change_script) else {
                return Err(SendError::NoChangeAddress);
            };
            outputs.push(PlannedOutput {
                address: address.trim().to_string(),
                script_pubkey: script,
                amount: selected.change,
                label: None,
                is_change: true,
            });
        }

        let plan = TransactionPlan {
            inputs: selected.utxos,
            input_types: selected.input_types,
            outputs,
            fee: selected.fee,
            vsize: selected.vsize,
            fee_rate,
            rbf: self.config.enable_rbf,
        };
        if !plan.is_balanced() {
            return Err(SendError::InvalidState(format!(
                "plan does not balance: {} in, {} out, {} fee",
                plan.input_total(),
                plan.output_total(),
                plan.fee
            )));
        }
        debug!(
            inputs = plan.inputs.len(),
            outputs = plan.outputs.len(),
            fee = plan.fee,
            vsize = plan.vsize,
            "planned transaction"
        );
        Ok(plan)
    }

    /// Turns a plan into an unsigned PSBT.
    ///
    /// Legacy inputs must already carry their previous transaction. For
    /// multisig wallets `paths` maps addresses to paths relative to each
    /// cosigner's account key; single-key wallets need no paths here.
    pub fn to_psbt(&self, plan: &TransactionPlan, paths: &AddressPaths) -> Result<Psbt, SendError> {
        let mut psbt = Psbt::from_unsigned_tx(plan.unsigned_transaction())
            .map_err(|e| SendError::InvalidPsbt(e.to_string()))?;

        for (index, (utxo, input_type)) in plan.inputs.iter().zip(&plan.input_types).enumerate() {
            let input = &mut psbt.inputs[index];
            if input_type.requires_previous_transaction() {
                let hex = utxo.raw_tx_hex.as_deref().ok_or(
                    SendError::PreviousTransactionUnavailable {
                        txid: utxo.outpoint.txid,
                    },
                )?;
                input.non_witness_utxo = Some(decode_previous_transaction(hex, &utxo.outpoint)?);
            } else {
                input.witness_utxo = Some(utxo.txout());
            }

            if let Some(multisig) = &self.multisig {
                let relative = paths.get(&utxo.address).ok_or_else(|| {
                    SendError::DerivationPathMissing {
                        address: utxo.address.clone(),
                    }
                })?;
                multisig.prepare_psbt_input(&self.secp, input, &utxo.txout(), relative)?;
            }
        }

        if let Some(multisig) = &self.multisig {
            for (index, output) in plan.outputs.iter().enumerate() {
                if !output.is_change {
                    continue;
                }
                if let Some(relative) = paths.get(&output.address) {
                    multisig.prepare_psbt_output(&self.secp, &mut psbt.outputs[index], relative)?;
                }
            }
        }
        Ok(psbt)
    }

    fn build_plan(
        &self,
        plan: TransactionPlan,
        paths: &AddressPaths,
    ) -> Result<BuiltTransaction, SendError> {
        let psbt = self.to_psbt(&plan, paths)?;
        Ok(BuiltTransaction { psbt, plan })
    }

    /// One recipient plus change.
    pub fn build(
        &self,
        recipient: &Recipient,
        utxos: &[Utxo],
        change_address: Option<&str>,
        fee_rate: FeeRate,
        paths: &AddressPaths,
    ) -> Result<BuiltTransaction, SendError> {
        let plan = self.plan(
            std::slice::from_ref(recipient),
            utxos,
            change_address,
            fee_rate,
            false,
        )?;
        self.build_plan(plan, paths)
    }

    /// One output per non-empty recipient plus change.
    pub fn build_multi_recipient(
        &self,
        recipients: &[Recipient],
        utxos: &[Utxo],
        change_address: Option<&str>,
        fee_rate: FeeRate,
        paths: &AddressPaths,
    ) -> Result<BuiltTransaction, SendError> {
        let plan = self.plan(recipients, utxos, change_address, fee_rate, false)?;
        self.build_plan(plan, paths)
    }

    /// Sweeps every eligible (or coin-controlled) output to `address`.
    pub fn build_send_max(
        &self,
        address: &str,
        utxos: &[Utxo],
        fee_rate: FeeRate,
        paths: &AddressPaths,
    ) -> Result<BuiltTransaction, SendError> {
        let plan = self.plan(&[Recipient::new(address, 0)], utxos, None, fee_rate, true)?;
        self.build_plan(plan, paths)
    }
}
