//! Previous-transaction enrichment for legacy inputs.
//!
//! Legacy sighashes commit to the whole previous transaction, so P2PKH and
//! bare P2SH inputs need its raw bytes. Missing transactions are fetched in
//! one batch per build and kept in a bounded LRU cache shared by the build,
//! sign and export steps of a send attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use miniscript::bitcoin::consensus::encode::deserialize_hex;
use miniscript::bitcoin::{OutPoint, Transaction, Txid};
use tracing::{debug, warn};

use crate::collaborators::RawTransactionSource;
use crate::dimensions::InputScriptType;
use crate::error::SendError;
use crate::types::Utxo;

/// Raw transaction hex by txid, evicting the least recently used entry.
#[derive(Debug, Clone)]
pub struct RawTxCache {
    capacity: usize,
    entries: HashMap<Txid, String>,
    order: VecDeque<Txid>,
}

impl RawTxCache {
    pub fn new(capacity: usize) -> Self {
        RawTxCache {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, txid: &Txid) {
        if let Some(pos) = self.order.iter().position(|t| t == txid) {
            self.order.remove(pos);
        }
        self.order.push_back(*txid);
    }

    pub fn get(&mut self, txid: &Txid) -> Option<String> {
        let hex = self.entries.get(txid).cloned()?;
        self.touch(txid);
        Some(hex)
    }

    pub fn insert(&mut self, txid: Txid, hex: String) {
        self.entries.insert(txid, hex);
        self.touch(&txid);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn remove(&mut self, txid: &Txid) -> Option<String> {
        if let Some(pos) = self.order.iter().position(|t| t == txid) {
            self.order.remove(pos);
        }
        self.entries.remove(txid)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decodes a previous transaction and checks it is the one `outpoint` spends.
pub fn decode_previous_transaction(
    hex: &str,
    outpoint: &OutPoint,
) -> Result<Transaction, SendError> {
    let unavailable = |reason: String| {
        warn!("previous transaction {} rejected: {}", outpoint.txid, reason);
        SendError::PreviousTransactionUnavailable {
            txid: outpoint.txid,
        }
    };
    let tx: Transaction = deserialize_hex(hex.trim()).map_err(|e| unavailable(e.to_string()))?;
    if tx.compute_txid() != outpoint.txid {
        return Err(unavailable(format!("hashes to {}", tx.compute_txid())));
    }
    if tx.output.len() <= outpoint.vout as usize {
        return Err(unavailable(format!("has no output {}", outpoint.vout)));
    }
    Ok(tx)
}

pub struct LegacyEnricher<'a> {
    source: &'a dyn RawTransactionSource,
    cache: &'a Mutex<RawTxCache>,
}

impl<'a> LegacyEnricher<'a> {
    pub fn new(source: &'a dyn RawTransactionSource, cache: &'a Mutex<RawTxCache>) -> Self {
        LegacyEnricher { source, cache }
    }

    fn with_cache<T>(&self, f: impl FnOnce(&mut RawTxCache) -> T) -> Result<T, SendError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| SendError::InvalidState("raw transaction cache poisoned".to_string()))?;
        Ok(f(&mut cache))
    }

    /// Fills `raw_tx_hex` on every input that needs it.
    ///
    /// Hex already on a UTXO or in the cache is reused; the rest is fetched in
    /// a single call. Every transaction is checked against its outpoint.
    pub async fn enrich(
        &self,
        utxos: &mut [Utxo],
        input_types: &[InputScriptType],
    ) -> Result<(), SendError> {
        let mut missing: Vec<Txid> = Vec::new();
        for (utxo, input_type) in utxos.iter_mut().zip(input_types) {
            if !input_type.requires_previous_transaction() {
                continue;
            }
            if let Some(hex) = &utxo.raw_tx_hex {
                decode_previous_transaction(hex, &utxo.outpoint)?;
                let hex = hex.clone();
                self.with_cache(|c| c.insert(utxo.outpoint.txid, hex))?;
                continue;
            }
            match self.with_cache(|c| c.get(&utxo.outpoint.txid))? {
                Some(hex) => {
                    debug!("raw transaction {} served from cache", utxo.outpoint.txid);
                    utxo.raw_tx_hex = Some(hex);
                }
                None if !missing.contains(&utxo.outpoint.txid) => {
                    missing.push(utxo.outpoint.txid)
                }
                None => {}
            }
        }

        if !missing.is_empty() {
            debug!("fetching {} previous transactions", missing.len());
            let fetched = self.source.fetch_raw_transactions(&missing).await?;
            for txid in &missing {
                if let Some(hex) = fetched.get(txid) {
                    self.with_cache(|c| c.insert(*txid, hex.clone()))?;
                }
            }
        }

        for (utxo, input_type) in utxos.iter_mut().zip(input_types) {
            if !input_type.requires_previous_transaction() || utxo.raw_tx_hex.is_some() {
                continue;
            }
            let hex = self
                .with_cache(|c| c.get(&utxo.outpoint.txid))?
                .ok_or(SendError::PreviousTransactionUnavailable {
                    txid: utxo.outpoint.txid,
                })?;
            if let Err(e) = decode_previous_transaction(&hex, &utxo.outpoint) {
                // never keep a transaction that failed verification
                self.with_cache(|c| c.remove(&utxo.outpoint.txid))?;
                return Err(e);
            }
            utxo.raw_tx_hex = Some(hex);
        }
        Ok(())
    }
}
