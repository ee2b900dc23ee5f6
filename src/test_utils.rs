//! Fixtures and in-memory collaborators shared by the unit tests.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use miniscript::bitcoin::absolute::LockTime;
use miniscript::bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv, Xpub};
use miniscript::bitcoin::consensus::encode::deserialize_hex;
use miniscript::bitcoin::hashes::{sha256, Hash};
use miniscript::bitcoin::psbt::Psbt;
use miniscript::bitcoin::secp256k1::Secp256k1;
use miniscript::bitcoin::transaction::Version;
use miniscript::bitcoin::{
    Address, Amount, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    WPubkeyHash, Witness,
};
use zeroize::Zeroizing;

use crate::collaborators::{Broadcaster, FeeEstimateSource, KeyRef, KeyVault, RawTransactionSource};
use crate::error::SendError;
use crate::keys::SecretMaterial;
use crate::multisig::{Cosigner, MultisigConfig, MultisigScriptType};
use crate::types::{FeeEstimates, Utxo};

/// BIP39 test mnemonic; master fingerprint 73c5da0a.
pub const ABANDON_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

const COSIGNER_ACCOUNT_PATH: &str = "m/48'/1'/0'/2'";

pub fn test_xpriv(seed: &str) -> Xpriv {
    // hash seed into 32 bytes
    let seed_hash = sha256::Hash::hash(seed.as_bytes()).to_byte_array();
    Xpriv::new_master(miniscript::bitcoin::Network::Testnet, &seed_hash)
        .expect("could not create xpriv from seed")
}

pub fn test_p2wpkh_script(byte: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([byte; 20]))
}

pub fn test_p2pkh_script(byte: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([byte; 20]))
}

/// A transaction paying `outputs`, unique per `nonce`.
pub fn funding_tx(outputs: &[(ScriptBuf, u64)], nonce: u32) -> Transaction {
    let parent = sha256::Hash::hash(&nonce.to_le_bytes()).to_byte_array();
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array(parent), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs
            .iter()
            .map(|(script, value)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: script.clone(),
            })
            .collect(),
    }
}

/// Confirmed P2WPKH output; distinct outpoint per `index`.
pub fn p2wpkh_utxo(index: u32, value: u64) -> Utxo {
    let script = test_p2wpkh_script(index as u8);
    let tx = funding_tx(&[(script.clone(), value)], index);
    let address = Address::from_script(&script, miniscript::bitcoin::Network::Bitcoin)
        .expect("p2wpkh script has an address");
    Utxo::new(
        OutPoint::new(tx.compute_txid(), 0),
        value,
        address.to_string(),
        script,
    )
}

fn unsigned_tx(outpoints: Vec<OutPoint>, outputs: &[u64]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: outpoints
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|value| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: test_p2wpkh_script(0xee),
            })
            .collect(),
    }
}

/// Input `i` spends output 0 of `funding_tx(&[inputs[i]], i)`, with
/// `witness_utxo` set.
pub fn unsigned_psbt(inputs: &[(ScriptBuf, u64)], outputs: &[u64]) -> Psbt {
    let funding: Vec<Transaction> = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| funding_tx(std::slice::from_ref(input), i as u32))
        .collect();
    let outpoints = funding
        .iter()
        .map(|tx| OutPoint::new(tx.compute_txid(), 0))
        .collect();
    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(outpoints, outputs)).unwrap();
    for (input, tx) in psbt.inputs.iter_mut().zip(&funding) {
        input.witness_utxo = Some(tx.output[0].clone());
    }
    psbt
}

pub fn cosigner_xpriv(index: usize) -> Xpriv {
    test_xpriv(&format!("cosigner/{}", index))
}

pub fn cosigner_material(index: usize) -> SecretMaterial {
    SecretMaterial::Xprv(Zeroizing::new(cosigner_xpriv(index).to_string()))
}

pub fn test_cosigner(index: usize, is_local: bool) -> Cosigner {
    let secp = Secp256k1::new();
    let root = cosigner_xpriv(index);
    let derivation_path = DerivationPath::from_str(COSIGNER_ACCOUNT_PATH).unwrap();
    let account = root.derive_priv(&secp, &derivation_path).unwrap();
    Cosigner {
        name: format!("cosigner-{}", index),
        fingerprint: root.fingerprint(&secp),
        xpub: Xpub::from_priv(&secp, &account),
        derivation_path,
        is_local,
    }
}

/// m-of-3 with cosigners 0 and 1 held locally.
pub fn test_multisig_config(m: usize, script_type: MultisigScriptType) -> MultisigConfig {
    let cosigners = vec![
        test_cosigner(0, true),
        test_cosigner(1, true),
        test_cosigner(2, false),
    ];
    MultisigConfig::new(m, script_type, cosigners).unwrap()
}

/// Unsigned multisig PSBT; input `i` spends the wallet address at `m/0/i`.
pub fn multisig_psbt(config: &MultisigConfig, values: &[u64]) -> Psbt {
    let secp = Secp256k1::verification_only();
    let paths: Vec<DerivationPath> = (0..values.len())
        .map(|i| DerivationPath::from_str(&format!("m/0/{}", i)).unwrap())
        .collect();
    let funding: Vec<Transaction> = values
        .iter()
        .zip(&paths)
        .enumerate()
        .map(|(i, (value, path))| {
            let script = config.output_script(&secp, path).unwrap();
            funding_tx(&[(script, *value)], 100 + i as u32)
        })
        .collect();
    let outpoints = funding
        .iter()
        .map(|tx| OutPoint::new(tx.compute_txid(), 0))
        .collect();
    let total: u64 = values.iter().sum();
    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(outpoints, &[total - 2_000])).unwrap();
    for (input, tx) in psbt.inputs.iter_mut().zip(funding) {
        if config.script_type == MultisigScriptType::P2sh {
            input.non_witness_utxo = Some(tx);
        } else {
            input.witness_utxo = Some(tx.output[0].clone());
        }
    }
    config.prepare_psbt(&secp, &mut psbt, &paths).unwrap();
    psbt
}

/// PIN-protected in-memory key store.
pub struct MemoryVault {
    pin: String,
    entries: HashMap<KeyRef, SecretMaterial>,
}

impl MemoryVault {
    pub fn new(pin: &str) -> Self {
        MemoryVault {
            pin: pin.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn with_wallet(mut self, material: SecretMaterial) -> Self {
        self.entries.insert(KeyRef::Wallet, material);
        self
    }

    pub fn with_global_seed(mut self, material: SecretMaterial) -> Self {
        self.entries.insert(KeyRef::GlobalSeed, material);
        self
    }

    pub fn with_cosigner(mut self, fingerprint: Fingerprint, material: SecretMaterial) -> Self {
        self.entries.insert(KeyRef::Cosigner(fingerprint), material);
        self
    }
}

impl KeyVault for MemoryVault {
    fn unlock(&self, pin: &str, key: &KeyRef) -> Result<Option<SecretMaterial>, SendError> {
        if pin != self.pin {
            return Err(SendError::KeyAccessFailure("wrong PIN".to_string()));
        }
        Ok(self.entries.get(key).cloned())
    }
}

/// Records every submitted transaction.
pub struct FakeBroadcaster {
    rejection: Option<String>,
    sent: Mutex<Vec<String>>,
}

impl FakeBroadcaster {
    pub fn accepting() -> Self {
        FakeBroadcaster {
            rejection: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(reason: &str) -> Self {
        FakeBroadcaster {
            rejection: Some(reason.to_string()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Transactions accepted so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, SendError> {
        if let Some(reason) = &self.rejection {
            return Err(SendError::broadcast_rejected(reason));
        }
        let tx: Transaction =
            deserialize_hex(raw_tx_hex).map_err(|e| SendError::InvalidPsbt(e.to_string()))?;
        self.sent.lock().unwrap().push(raw_tx_hex.to_string());
        Ok(tx.compute_txid())
    }
}

pub struct FakeFeeSource {
    estimates: Option<FeeEstimates>,
    calls: AtomicUsize,
}

impl FakeFeeSource {
    pub fn new(fast: u64, normal: u64, slow: u64) -> Self {
        FakeFeeSource {
            estimates: Some(FeeEstimates { fast, normal, slow }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        FakeFeeSource {
            estimates: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeeEstimateSource for FakeFeeSource {
    async fn fetch_fee_estimates(&self) -> Result<FeeEstimates, SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.estimates
            .ok_or_else(|| SendError::NetworkError("fee service unavailable".to_string()))
    }
}

pub struct FakeRawTxSource {
    known: HashMap<Txid, String>,
    requested: Mutex<Vec<Vec<Txid>>>,
}

impl FakeRawTxSource {
    pub fn new(known: Vec<(Txid, String)>) -> Self {
        FakeRawTxSource {
            known: known.into_iter().collect(),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requested.lock().unwrap().len()
    }

    /// Txids asked for, one entry per call.
    pub fn requested(&self) -> Vec<Vec<Txid>> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl RawTransactionSource for FakeRawTxSource {
    async fn fetch_raw_transactions(
        &self,
        txids: &[Txid],
    ) -> Result<HashMap<Txid, String>, SendError> {
        self.requested.lock().unwrap().push(txids.to_vec());
        Ok(txids
            .iter()
            .filter_map(|txid| self.known.get(txid).map(|hex| (*txid, hex.clone())))
            .collect())
    }
}
