//! Dimensions for estimating transaction virtual size.
//!
//! Weight-based estimation for fee sizing, tracking min/max bounds to account
//! for ECDSA signature variance. Fees are always sized on the max bound so a
//! signed transaction never pays less than the rate it was built for.

use miniscript::bitcoin::{Script, VarInt};

// ============================================================================
// Weight calculation constants
// ============================================================================

// ECDSA signature sizes (DER encoding variance, including sighash byte)
const ECDSA_SIG_MIN: usize = 71;
const ECDSA_SIG_MAX: usize = 73;

// Schnorr signature with default sighash (no sighash byte)
const SCHNORR_SIG: usize = 64;

// Script constants
const OP_SIZE: usize = 1;
const OP_0_SIZE: usize = OP_SIZE;
const OP_PUSH_SIZE: usize = OP_SIZE;

const COMPRESSED_PUBKEY_SIZE: usize = 33;
const P2WPKH_PUB_SCRIPT_SIZE: usize = 22;
const P2WSH_PUB_SCRIPT_SIZE: usize = 34;

// Transaction overhead
const TX_OVERHEAD_SIZE: usize = 10; // version(4) + locktime(4) + varint for ins(1) + varint for outs(1)
const TX_SEGWIT_OVERHEAD_SIZE: usize = 11; // adds marker(1) + flag(1), but witness varint saves 1

// ============================================================================
// Weight calculation helpers
// ============================================================================

/// Compute the size of a length-prefixed slice (varint + data)
fn var_slice_size(length: usize) -> usize {
    VarInt::from(length).size() + length
}

/// Compute the size of a witness vector
fn vector_size(element_lengths: &[usize]) -> usize {
    VarInt::from(element_lengths.len()).size()
        + element_lengths
            .iter()
            .map(|&len| var_slice_size(len))
            .sum::<usize>()
}

/// Compute input weight from script and witness component lengths
fn compute_input_weight(script_components: &[usize], witness_components: &[usize]) -> usize {
    let script_length: usize = script_components.iter().sum();
    // Base size: prevout(32) + index(4) + sequence(4) + scriptSig
    let base_size = 40 + var_slice_size(script_length);
    let witness_size = if witness_components.is_empty() {
        0
    } else {
        vector_size(witness_components)
    };
    // Weight = 3 * base + (base + witness)
    3 * base_size + base_size + witness_size
}

/// Compute output weight from script length
fn compute_output_weight(script_length: usize) -> usize {
    4 * (8 + var_slice_size(script_length))
}

/// Size of the opcode that pushes `len` bytes in a scriptSig
fn push_opcode_size(len: usize) -> usize {
    match len {
        0..=75 => 1,
        76..=255 => 2,
        256..=65535 => 3,
        _ => 5,
    }
}

/// `OP_m <pubkey>*n OP_n OP_CHECKMULTISIG`
pub fn multisig_script_size(n: usize) -> usize {
    OP_SIZE + n * (OP_PUSH_SIZE + COMPRESSED_PUBKEY_SIZE) + OP_SIZE + OP_SIZE
}

// ============================================================================
// Input script types
// ============================================================================

/// How an input will be spent, which fixes its satisfaction size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputScriptType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
    P2trKeyPath,
    P2shMultisig { m: usize, n: usize },
    P2shP2wshMultisig { m: usize, n: usize },
    P2wshMultisig { m: usize, n: usize },
}

impl InputScriptType {
    /// Input type for an output controlled by a single key.
    ///
    /// P2SH outputs of single-key wallets are assumed to wrap P2WPKH.
    pub fn for_single_key(script_pubkey: &Script) -> Option<Self> {
        if script_pubkey.is_p2pkh() {
            Some(InputScriptType::P2pkh)
        } else if script_pubkey.is_p2sh() {
            Some(InputScriptType::P2shP2wpkh)
        } else if script_pubkey.is_p2wpkh() {
            Some(InputScriptType::P2wpkh)
        } else if script_pubkey.is_p2tr() {
            Some(InputScriptType::P2trKeyPath)
        } else {
            None
        }
    }

    /// Legacy inputs sign over the full previous transaction.
    pub fn requires_previous_transaction(&self) -> bool {
        matches!(
            self,
            InputScriptType::P2pkh | InputScriptType::P2shMultisig { .. }
        )
    }

    pub fn is_segwit(&self) -> bool {
        !self.requires_previous_transaction()
    }
}

struct InputWeights {
    min: usize,
    max: usize,
    is_segwit: bool,
}

fn get_p2pkh_components(sig_size: usize) -> Vec<usize> {
    vec![
        OP_PUSH_SIZE + sig_size,
        OP_PUSH_SIZE + COMPRESSED_PUBKEY_SIZE,
    ]
}

fn get_p2sh_p2wpkh_components(sig_size: usize) -> (Vec<usize>, Vec<usize>) {
    (
        vec![OP_PUSH_SIZE + P2WPKH_PUB_SCRIPT_SIZE],
        vec![sig_size, COMPRESSED_PUBKEY_SIZE],
    )
}

fn get_p2wpkh_components(sig_size: usize) -> (Vec<usize>, Vec<usize>) {
    (vec![], vec![sig_size, COMPRESSED_PUBKEY_SIZE])
}

fn get_p2tr_keypath_components() -> (Vec<usize>, Vec<usize>) {
    (vec![], vec![SCHNORR_SIG])
}

/// OP_0 (CHECKMULTISIG bug) + m signatures + redeem script push
fn get_p2sh_multisig_components(sig_size: usize, m: usize, n: usize) -> Vec<usize> {
    let script_size = multisig_script_size(n);
    let mut components = vec![OP_0_SIZE];
    components.extend(std::iter::repeat(OP_PUSH_SIZE + sig_size).take(m));
    components.push(push_opcode_size(script_size) + script_size);
    components
}

fn get_multisig_witness(sig_size: usize, m: usize, n: usize) -> Vec<usize> {
    let mut witness = vec![0]; // empty element for CHECKMULTISIG
    witness.extend(std::iter::repeat(sig_size).take(m));
    witness.push(multisig_script_size(n));
    witness
}

fn get_input_weights_for_type(script_type: InputScriptType) -> InputWeights {
    let by_sig = |f: &dyn Fn(usize) -> (Vec<usize>, Vec<usize>), is_segwit: bool| {
        let (script_min, witness_min) = f(ECDSA_SIG_MIN);
        let (script_max, witness_max) = f(ECDSA_SIG_MAX);
        InputWeights {
            min: compute_input_weight(&script_min, &witness_min),
            max: compute_input_weight(&script_max, &witness_max),
            is_segwit,
        }
    };

    match script_type {
        InputScriptType::P2pkh => by_sig(&|sig| (get_p2pkh_components(sig), vec![]), false),
        InputScriptType::P2shP2wpkh => by_sig(&get_p2sh_p2wpkh_components, true),
        InputScriptType::P2wpkh => by_sig(&get_p2wpkh_components, true),
        InputScriptType::P2trKeyPath => {
            let (script, witness) = get_p2tr_keypath_components();
            let w = compute_input_weight(&script, &witness);
            InputWeights {
                min: w,
                max: w,
                is_segwit: true,
            }
        }
        InputScriptType::P2shMultisig { m, n } => by_sig(
            &|sig| (get_p2sh_multisig_components(sig, m, n), vec![]),
            false,
        ),
        InputScriptType::P2shP2wshMultisig { m, n } => by_sig(
            &|sig| {
                (
                    vec![OP_PUSH_SIZE + P2WSH_PUB_SCRIPT_SIZE],
                    get_multisig_witness(sig, m, n),
                )
            },
            true,
        ),
        InputScriptType::P2wshMultisig { m, n } => {
            by_sig(&|sig| (vec![], get_multisig_witness(sig, m, n)), true)
        }
    }
}

// ============================================================================
// Dimensions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeBound {
    Min,
    Max,
}

/// Accumulated weight of a transaction under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dimensions {
    input_weight_min: usize,
    input_weight_max: usize,
    output_weight: usize,
    has_segwit: bool,
}

impl Dimensions {
    /// Create empty dimensions (zero weight)
    pub fn empty() -> Dimensions {
        Dimensions::default()
    }

    pub fn from_input(script_type: InputScriptType) -> Dimensions {
        let weights = get_input_weights_for_type(script_type);
        Dimensions {
            input_weight_min: weights.min,
            input_weight_max: weights.max,
            output_weight: 0,
            has_segwit: weights.is_segwit,
        }
    }

    pub fn from_inputs<'a>(types: impl IntoIterator<Item = &'a InputScriptType>) -> Dimensions {
        types
            .into_iter()
            .fold(Dimensions::empty(), |acc, t| acc.plus(&Dimensions::from_input(*t)))
    }

    pub fn from_output_script(script: &Script) -> Dimensions {
        Dimensions {
            output_weight: compute_output_weight(script.len()),
            ..Dimensions::default()
        }
    }

    pub fn from_output_scripts<'a>(scripts: impl IntoIterator<Item = &'a Script>) -> Dimensions {
        scripts
            .into_iter()
            .fold(Dimensions::empty(), |acc, s| {
                acc.plus(&Dimensions::from_output_script(s))
            })
    }

    /// Combine with another Dimensions instance
    pub fn plus(&self, other: &Dimensions) -> Dimensions {
        Dimensions {
            input_weight_min: self.input_weight_min + other.input_weight_min,
            input_weight_max: self.input_weight_max + other.input_weight_max,
            output_weight: self.output_weight + other.output_weight,
            has_segwit: self.has_segwit || other.has_segwit,
        }
    }

    /// Multiply dimensions by a scalar
    pub fn times(&self, n: usize) -> Dimensions {
        Dimensions {
            input_weight_min: self.input_weight_min * n,
            input_weight_max: self.input_weight_max * n,
            output_weight: self.output_weight * n,
            has_segwit: self.has_segwit,
        }
    }

    pub fn has_segwit(&self) -> bool {
        self.has_segwit
    }

    fn has_content(&self) -> bool {
        self.input_weight_max > 0 || self.output_weight > 0
    }

    fn overhead_weight(&self) -> usize {
        if !self.has_content() {
            return 0;
        }
        let overhead_size = if self.has_segwit {
            TX_SEGWIT_OVERHEAD_SIZE
        } else {
            TX_OVERHEAD_SIZE
        };
        4 * overhead_size
    }

    pub fn weight(&self, bound: SizeBound) -> u64 {
        let input_weight = match bound {
            SizeBound::Min => self.input_weight_min,
            SizeBound::Max => self.input_weight_max,
        };
        (self.overhead_weight() + input_weight + self.output_weight) as u64
    }

    pub fn vsize(&self, bound: SizeBound) -> u64 {
        self.weight(bound).div_ceil(4)
    }

    pub fn input_vsize(&self, bound: SizeBound) -> u64 {
        let weight = match bound {
            SizeBound::Min => self.input_weight_min,
            SizeBound::Max => self.input_weight_max,
        };
        (weight as u64).div_ceil(4)
    }

    pub fn output_vsize(&self) -> u64 {
        (self.output_weight as u64).div_ceil(4)
    }
}
