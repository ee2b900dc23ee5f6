//! UTXO selection.
//!
//! Selection is pure: it reads the wallet's outputs and returns the chosen set
//! together with the fee and change it implies. Persisting the choice (locking
//! coins, marking them pending) is left to the caller.

use std::collections::HashSet;

use miniscript::bitcoin::{FeeRate, OutPoint, Script, ScriptBuf};
use tracing::debug;

use crate::dimensions::{Dimensions, InputScriptType, SizeBound};
use crate::error::SendError;
use crate::multisig::MultisigScriptType;
use crate::types::{Recipient, Utxo};

/// How inputs are chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMode {
    /// Largest-first over every output that is neither frozen nor locked.
    Auto,
    /// Exactly the caller's coin-control set.
    Manual(Vec<OutPoint>),
    /// Spend the whole eligible set (or the coin-control set) with no change.
    SendMax { coin_control: Option<Vec<OutPoint>> },
}

/// Spending shape of the wallet, which fixes how each input is sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendProfile {
    SingleKey,
    Multisig {
        script_type: MultisigScriptType,
        m: usize,
        n: usize,
    },
}

impl SpendProfile {
    pub fn input_type(&self, utxo: &Utxo) -> Result<InputScriptType, SendError> {
        let unsupported = || SendError::InvalidAddress {
            address: utxo.address.clone(),
            reason: "unsupported script type for this wallet".to_string(),
        };
        match *self {
            SpendProfile::SingleKey => {
                InputScriptType::for_single_key(&utxo.script_pubkey).ok_or_else(unsupported)
            }
            SpendProfile::Multisig { script_type, m, n } => {
                if !script_type.matches_output(&utxo.script_pubkey) {
                    return Err(unsupported());
                }
                Ok(script_type.input_script_type(m, n))
            }
        }
    }
}

/// Fee parameters shared by every candidate set.
#[derive(Debug, Clone)]
pub struct FeeContext<'a> {
    pub fee_rate: FeeRate,
    pub recipient_scripts: &'a [ScriptBuf],
    pub change_script: Option<&'a Script>,
    pub dust_threshold: u64,
}

/// Inputs chosen for a transaction and the fee and change they imply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedInputs {
    pub utxos: Vec<Utxo>,
    pub input_types: Vec<InputScriptType>,
    pub total: u64,
    pub fee: u64,
    /// Zero when no change output is emitted.
    pub change: u64,
    pub vsize: u64,
    /// Amount the send-max recipient receives.
    pub send_max_amount: Option<u64>,
}

impl SelectedInputs {
    pub fn has_change(&self) -> bool {
        self.change > 0
    }

    pub fn has_unconfirmed(&self) -> bool {
        self.utxos.iter().any(Utxo::is_unconfirmed)
    }
}

struct Settlement {
    fee: u64,
    change: u64,
    vsize: u64,
}

pub(crate) fn fee_for_vsize(rate: FeeRate, vsize: u64) -> Result<u64, SendError> {
    rate.fee_vb(vsize)
        .map(|a| a.to_sat())
        .ok_or_else(|| SendError::InvalidState(format!("fee overflow for {} vbytes", vsize)))
}

/// Balance left for `recipients[index]` once earlier recipients are paid.
pub fn remaining_for_recipient(total: u64, recipients: &[Recipient], index: usize) -> u64 {
    let committed: u64 = recipients
        .iter()
        .take(index)
        .map(|r| r.amount)
        .sum();
    total.saturating_sub(committed)
}

pub struct UtxoSelector {
    profile: SpendProfile,
}

impl UtxoSelector {
    pub fn new(profile: SpendProfile) -> Self {
        UtxoSelector { profile }
    }

    pub fn profile(&self) -> SpendProfile {
        self.profile
    }

    /// Chooses inputs paying `target` sats to the recipients in `ctx`.
    ///
    /// # Arguments
    /// * `available` - Wallet outputs, duplicates by outpoint are ignored
    /// * `target` - Sum of recipient amounts (fixed recipients only for send-max)
    /// * `ctx` - Fee rate, output scripts and dust threshold
    /// * `mode` - Selection strategy
    pub fn select(
        &self,
        available: &[Utxo],
        target: u64,
        ctx: &FeeContext<'_>,
        mode: &SelectionMode,
    ) -> Result<SelectedInputs, SendError> {
        match mode {
            SelectionMode::Auto => self.select_auto(available, target, ctx),
            SelectionMode::Manual(outpoints) => {
                let utxos = pick_outpoints(available, outpoints)?;
                self.select_fixed(utxos, target, ctx)
            }
            SelectionMode::SendMax { coin_control } => {
                let utxos = match coin_control {
                    Some(outpoints) => pick_outpoints(available, outpoints)?,
                    None => eligible(available),
                };
                self.select_send_max(utxos, target, ctx)
            }
        }
    }

    fn typed(&self, utxos: &[Utxo]) -> Result<Vec<InputScriptType>, SendError> {
        utxos.iter().map(|u| self.profile.input_type(u)).collect()
    }

    fn select_auto(
        &self,
        available: &[Utxo],
        target: u64,
        ctx: &FeeContext<'_>,
    ) -> Result<SelectedInputs, SendError> {
        let mut candidates = eligible(available);
        if candidates.is_empty() {
            return Err(SendError::NoUtxos);
        }
        candidates.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then(b.confirmations.cmp(&a.confirmations))
        });

        let mut chosen = Vec::new();
        let mut types = Vec::new();
        let mut inputs = Dimensions::empty();
        let mut total = 0u64;
        let mut shortfall = target;

        for utxo in candidates {
            let input_type = self.profile.input_type(&utxo)?;
            inputs = inputs.plus(&Dimensions::from_input(input_type));
            total = total.saturating_add(utxo.value);
            chosen.push(utxo);
            types.push(input_type);

            match settle(&inputs, total, target, ctx)? {
                Some(s) => {
                    debug!(
                        inputs = chosen.len(),
                        fee = s.fee,
                        change = s.change,
                        "selected inputs"
                    );
                    return Ok(SelectedInputs {
                        utxos: chosen,
                        input_types: types,
                        total,
                        fee: s.fee,
                        change: s.change,
                        vsize: s.vsize,
                        send_max_amount: None,
                    });
                }
                None => {
                    let vsize = with_outputs(&inputs, ctx).vsize(SizeBound::Max);
                    shortfall = target.saturating_add(fee_for_vsize(ctx.fee_rate, vsize)?);
                }
            }
        }

        Err(SendError::InsufficientFunds {
            needed: shortfall,
            available: total,
        })
    }

    fn select_fixed(
        &self,
        utxos: Vec<Utxo>,
        target: u64,
        ctx: &FeeContext<'_>,
    ) -> Result<SelectedInputs, SendError> {
        let types = self.typed(&utxos)?;
        let inputs = Dimensions::from_inputs(&types);
        let total = utxos.iter().map(|u| u.value).sum::<u64>();

        match settle(&inputs, total, target, ctx)? {
            Some(s) => Ok(SelectedInputs {
                utxos,
                input_types: types,
                total,
                fee: s.fee,
                change: s.change,
                vsize: s.vsize,
                send_max_amount: None,
            }),
            None => {
                let vsize = with_outputs(&inputs, ctx).vsize(SizeBound::Max);
                Err(SendError::InsufficientFunds {
                    needed: target.saturating_add(fee_for_vsize(ctx.fee_rate, vsize)?),
                    available: total,
                })
            }
        }
    }

    /// `max_sendable = total - fee(no change) - target`.
    fn select_send_max(
        &self,
        utxos: Vec<Utxo>,
        target: u64,
        ctx: &FeeContext<'_>,
    ) -> Result<SelectedInputs, SendError> {
        if utxos.is_empty() {
            return Err(SendError::NoUtxos);
        }
        let types = self.typed(&utxos)?;
        let inputs = Dimensions::from_inputs(&types);
        let total = utxos.iter().map(|u| u.value).sum::<u64>();
        let vsize = with_outputs(&inputs, ctx).vsize(SizeBound::Max);
        let fee = fee_for_vsize(ctx.fee_rate, vsize)?;

        let needed = fee.saturating_add(target);
        if total <= needed {
            return Err(SendError::InsufficientFunds {
                needed: needed.saturating_add(1),
                available: total,
            });
        }
        let max_sendable = total - needed;
        if max_sendable < ctx.dust_threshold {
            return Err(SendError::DustOutput {
                amount: max_sendable,
                threshold: ctx.dust_threshold,
            });
        }

        Ok(SelectedInputs {
            utxos,
            input_types: types,
            total,
            fee,
            change: 0,
            vsize,
            send_max_amount: Some(max_sendable),
        })
    }
}

fn with_outputs(inputs: &Dimensions, ctx: &FeeContext<'_>) -> Dimensions {
    inputs.plus(&Dimensions::from_output_scripts(
        ctx.recipient_scripts.iter().map(|s| s.as_script()),
    ))
}

/// Works out fee and change for a fixed input set.
///
/// Change is only emitted when it clears the dust threshold after paying for
/// its own output; otherwise the remainder is folded into the fee.
fn settle(
    inputs: &Dimensions,
    total: u64,
    target: u64,
    ctx: &FeeContext<'_>,
) -> Result<Option<Settlement>, SendError> {
    let base = with_outputs(inputs, ctx);

    let vsize_without = base.vsize(SizeBound::Max);
    let fee_without = fee_for_vsize(ctx.fee_rate, vsize_without)?;
    let Some(remainder) = total.checked_sub(target.saturating_add(fee_without)) else {
        return Ok(None);
    };

    if let Some(change_script) = ctx.change_script {
        let vsize_with = base
            .plus(&Dimensions::from_output_script(change_script))
            .vsize(SizeBound::Max);
        let fee_with = fee_for_vsize(ctx.fee_rate, vsize_with)?;
        if let Some(change) = total.checked_sub(target.saturating_add(fee_with)) {
            if change >= ctx.dust_threshold {
                return Ok(Some(Settlement {
                    fee: fee_with,
                    change,
                    vsize: vsize_with,
                }));
            }
        }
    } else if remainder >= ctx.dust_threshold {
        return Err(SendError::NoChangeAddress);
    }

    Ok(Some(Settlement {
        fee: total - target,
        change: 0,
        vsize: vsize_without,
    }))
}

fn eligible(available: &[Utxo]) -> Vec<Utxo> {
    let mut seen = HashSet::new();
    available
        .iter()
        .filter(|u| u.is_auto_spendable())
        .filter(|u| seen.insert(u.outpoint))
        .cloned()
        .collect()
}

fn pick_outpoints(available: &[Utxo], outpoints: &[OutPoint]) -> Result<Vec<Utxo>, SendError> {
    let mut seen = HashSet::new();
    let mut picked = Vec::new();
    for outpoint in outpoints {
        if !seen.insert(*outpoint) {
            continue;
        }
        let utxo = available
            .iter()
            .find(|u| u.outpoint == *outpoint)
            .ok_or_else(|| {
                SendError::InvalidState(format!("coin control output {} is not available", outpoint))
            })?;
        picked.push(utxo.clone());
    }
    if picked.is_empty() {
        return Err(SendError::NoUtxos);
    }
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{p2wpkh_utxo, test_p2wpkh_script};
    use rstest::rstest;

    const DUST: u64 = 547;

    fn ctx<'a>(
        rate: u64,
        recipients: &'a [ScriptBuf],
        change: Option<&'a Script>,
    ) -> FeeContext<'a> {
        FeeContext {
            fee_rate: FeeRate::from_sat_per_vb_unchecked(rate),
            recipient_scripts: recipients,
            change_script: change,
            dust_threshold: DUST,
        }
    }

    fn selector() -> UtxoSelector {
        UtxoSelector::new(SpendProfile::SingleKey)
    }

    #[test]
    fn test_single_input_with_change() {
        let recipients = vec![test_p2wpkh_script(1)];
        let change = test_p2wpkh_script(2);
        let utxos = vec![p2wpkh_utxo(0, 100_000)];
        let selected = selector()
            .select(
                &utxos,
                50_000,
                &ctx(10, &recipients, Some(&change)),
                &SelectionMode::Auto,
            )
            .unwrap();

        assert_eq!(selected.vsize, 142);
        assert_eq!(selected.fee, 1_420);
        assert_eq!(selected.change, 100_000 - 50_000 - 1_420);
        assert_eq!(selected.total, 50_000 + selected.change + selected.fee);
    }

    #[test]
    fn test_largest_first_and_frozen_excluded() {
        let recipients = vec![test_p2wpkh_script(1)];
        let change = test_p2wpkh_script(2);
        let utxos = vec![
            p2wpkh_utxo(0, 20_000),
            p2wpkh_utxo(1, 500_000).frozen(),
            p2wpkh_utxo(2, 60_000),
            p2wpkh_utxo(3, 40_000).locked(),
        ];
        let selected = selector()
            .select(
                &utxos,
                70_000,
                &ctx(1, &recipients, Some(&change)),
                &SelectionMode::Auto,
            )
            .unwrap();
        let values: Vec<u64> = selected.utxos.iter().map(|u| u.value).collect();
        assert_eq!(values, vec![60_000, 20_000]);
    }

    #[test]
    fn test_change_below_dust_is_folded_into_fee() {
        let recipients = vec![test_p2wpkh_script(1)];
        let change = test_p2wpkh_script(2);
        // without change: 44 + 273 + 124 = 441 wu -> 111 vB -> 111 sats
        let utxos = vec![p2wpkh_utxo(0, 50_000 + 111 + 300)];
        let selected = selector()
            .select(
                &utxos,
                50_000,
                &ctx(1, &recipients, Some(&change)),
                &SelectionMode::Auto,
            )
            .unwrap();
        assert_eq!(selected.change, 0);
        assert_eq!(selected.fee, 411);
        assert_eq!(selected.total, 50_000 + selected.fee);
    }

    #[test]
    fn test_insufficient_funds() {
        let recipients = vec![test_p2wpkh_script(1)];
        let change = test_p2wpkh_script(2);
        let utxos = vec![p2wpkh_utxo(0, 10_000)];
        let err = selector()
            .select(
                &utxos,
                10_000,
                &ctx(5, &recipients, Some(&change)),
                &SelectionMode::Auto,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SendError::InsufficientFunds {
                available: 10_000,
                ..
            }
        ));
    }

    #[test]
    fn test_no_utxos() {
        let recipients = vec![test_p2wpkh_script(1)];
        let utxos = vec![p2wpkh_utxo(0, 10_000).frozen()];
        let err = selector()
            .select(&utxos, 1_000, &ctx(1, &recipients, None), &SelectionMode::Auto)
            .unwrap_err();
        assert_eq!(err, SendError::NoUtxos);
    }

    #[test]
    fn test_missing_change_address() {
        let recipients = vec![test_p2wpkh_script(1)];
        let utxos = vec![p2wpkh_utxo(0, 100_000)];
        let err = selector()
            .select(&utxos, 1_000, &ctx(1, &recipients, None), &SelectionMode::Auto)
            .unwrap_err();
        assert_eq!(err, SendError::NoChangeAddress);
    }

    #[test]
    fn test_manual_uses_exact_set() {
        let recipients = vec![test_p2wpkh_script(1)];
        let change = test_p2wpkh_script(2);
        let utxos = vec![
            p2wpkh_utxo(0, 90_000),
            p2wpkh_utxo(1, 30_000).frozen(),
            p2wpkh_utxo(2, 30_000),
        ];
        let mode = SelectionMode::Manual(vec![
            utxos[1].outpoint,
            utxos[2].outpoint,
            utxos[2].outpoint,
        ]);
        let selected = selector()
            .select(&utxos, 40_000, &ctx(2, &recipients, Some(&change)), &mode)
            .unwrap();
        assert_eq!(selected.utxos.len(), 2);
        assert_eq!(selected.total, 60_000);
        assert_eq!(selected.total, 40_000 + selected.change + selected.fee);
    }

    #[test]
    fn test_manual_unknown_outpoint() {
        let recipients = vec![test_p2wpkh_script(1)];
        let utxos = vec![p2wpkh_utxo(0, 90_000)];
        let missing = p2wpkh_utxo(7, 1).outpoint;
        let err = selector()
            .select(
                &utxos,
                1_000,
                &ctx(1, &recipients, None),
                &SelectionMode::Manual(vec![missing]),
            )
            .unwrap_err();
        assert!(matches!(err, SendError::InvalidState(_)));
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(55)]
    fn test_send_max_leaves_no_remainder(#[case] rate: u64) {
        let recipients = vec![test_p2wpkh_script(1)];
        let utxos = vec![
            p2wpkh_utxo(0, 30_000),
            p2wpkh_utxo(1, 45_000),
            p2wpkh_utxo(2, 99_000).frozen(),
        ];
        let selected = selector()
            .select(
                &utxos,
                0,
                &ctx(rate, &recipients, None),
                &SelectionMode::SendMax { coin_control: None },
            )
            .unwrap();
        let max = selected.send_max_amount.unwrap();
        assert_eq!(selected.utxos.len(), 2);
        assert_eq!(max + selected.fee, selected.total);
        assert_eq!(selected.change, 0);
    }

    #[test]
    fn test_send_max_fee_exceeds_balance() {
        let recipients = vec![test_p2wpkh_script(1)];
        let utxos = vec![p2wpkh_utxo(0, 500)];
        let err = selector()
            .select(
                &utxos,
                0,
                &ctx(10, &recipients, None),
                &SelectionMode::SendMax { coin_control: None },
            )
            .unwrap_err();
        assert!(matches!(err, SendError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_send_max_dust_remainder() {
        let recipients = vec![test_p2wpkh_script(1)];
        // 111 vB at 1 sat/vB leaves 400 sats
        let utxos = vec![p2wpkh_utxo(0, 511)];
        let err = selector()
            .select(
                &utxos,
                0,
                &ctx(1, &recipients, None),
                &SelectionMode::SendMax { coin_control: None },
            )
            .unwrap_err();
        assert!(matches!(err, SendError::DustOutput { .. }));
    }

    #[test]
    fn test_remaining_for_recipient() {
        let recipients = vec![
            Recipient::new("a", 10_000),
            Recipient::new("b", 25_000),
            Recipient::new("c", 0),
        ];
        assert_eq!(remaining_for_recipient(50_000, &recipients, 0), 50_000);
        assert_eq!(remaining_for_recipient(50_000, &recipients, 1), 40_000);
        assert_eq!(remaining_for_recipient(50_000, &recipients, 2), 15_000);
        assert_eq!(remaining_for_recipient(20_000, &recipients, 2), 0);
    }

    #[test]
    fn test_multisig_profile_rejects_wrong_script() {
        let profile = SpendProfile::Multisig {
            script_type: MultisigScriptType::P2wsh,
            m: 2,
            n: 3,
        };
        let err = profile.input_type(&p2wpkh_utxo(0, 1_000)).unwrap_err();
        assert!(matches!(err, SendError::InvalidAddress { .. }));
    }
}
