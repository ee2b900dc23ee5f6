//! Maps raw failure messages onto the [`ErrorKind`] taxonomy.
//!
//! Structured [`SendError`] values already carry their kind. This module
//! handles the other case: free-form strings coming back from collaborators
//! (broadcast endpoints, explorers, the key vault) that must be sorted into
//! blocking and retryable failures before they reach the user.

use serde::Serialize;

use crate::error::{ErrorKind, RejectionCause, SendError, Severity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub level: Severity,
    pub message: String,
}

impl From<&SendError> for Classification {
    fn from(err: &SendError) -> Self {
        Classification {
            kind: err.kind(),
            level: err.severity(),
            message: err.to_string(),
        }
    }
}

const REPLACEMENT_FEE_MARKERS: &[&str] = &[
    "insufficient fee",
    "rejecting replacement",
    "replacement fee",
    "insufficient-fee",
];

const RBF_CONFLICT_MARKERS: &[&str] = &["non-bip125-replaceable", "txn-not-replaceable"];

const MEMPOOL_CONFLICT_MARKERS: &[&str] = &[
    "txn-mempool-conflict",
    "mempool-conflict",
    "double spend",
    "double-spend",
    "missingorspent",
    "missing-inputs",
    "txn-already-known",
];

const MIN_RELAY_MARKERS: &[&str] = &[
    "min relay fee not met",
    "mempool min fee not met",
    "min-relay",
    "minimum relay fee",
];

const NETWORK_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "econnrefused",
    "econnreset",
    "socket",
    "offline",
    "failed to fetch",
    "fetch failed",
    "unavailable",
];

/// `word` appears in `text` as a whole alphanumeric token.
fn has_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

/// Turns a raw broadcast rejection string into a specific cause.
pub fn humanize_broadcast_rejection(reason: &str) -> RejectionCause {
    let lower = reason.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(RBF_CONFLICT_MARKERS) {
        RejectionCause::RbfConflict
    } else if has(REPLACEMENT_FEE_MARKERS) {
        RejectionCause::ReplacementFeeTooLow
    } else if has(MEMPOOL_CONFLICT_MARKERS) {
        RejectionCause::MempoolConflict
    } else if has(MIN_RELAY_MARKERS) {
        RejectionCause::BelowMinRelayFee
    } else if lower.contains("dust") {
        RejectionCause::DustOutput
    } else {
        RejectionCause::Other(reason.trim().to_string())
    }
}

/// Classifies a raw failure message.
///
/// # Arguments
/// * `raw` - Message as produced by a collaborator or a stringified error
///
/// # Returns
/// The kind, its severity and a message suitable for display
pub fn classify(raw: &str) -> Classification {
    let lower = raw.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    let kind = if lower.contains("derivation path") {
        ErrorKind::DerivationPathMissing
    } else if lower.contains("dust") {
        ErrorKind::DustOutput
    } else if has(REPLACEMENT_FEE_MARKERS)
        || has(RBF_CONFLICT_MARKERS)
        || has(MEMPOOL_CONFLICT_MARKERS)
        || has(MIN_RELAY_MARKERS)
    {
        ErrorKind::BroadcastRejected
    } else if has(NETWORK_MARKERS) {
        ErrorKind::NetworkError
    } else if lower.contains("insufficient funds")
        || lower.contains("not enough funds")
        || lower.contains("insufficient balance")
    {
        ErrorKind::InsufficientFunds
    } else if lower.contains("no utxo") || lower.contains("no spendable") {
        ErrorKind::NoUtxos
    } else if lower.contains("no valid recipients") {
        ErrorKind::NoValidRecipients
    } else if lower.contains("invalid address")
        || lower.contains("invalid checksum")
        || lower.contains("unknown address")
    {
        ErrorKind::InvalidAddress
    } else if lower.contains("change address") {
        ErrorKind::NoChangeAddress
    } else if lower.contains("no local key") {
        ErrorKind::NoLocalKey
    } else if lower.contains("input mismatch") || lower.contains("inputs do not match") {
        ErrorKind::PsbtInputMismatch
    } else if lower.contains("insufficient signatures") || lower.contains("not enough signatures")
    {
        ErrorKind::InsufficientSignatures
    } else if lower.contains("finalize") {
        ErrorKind::FinalizeFailed
    } else if has_word(&lower, "pin")
        || lower.contains("decrypt")
        || lower.contains("key access")
        || lower.contains("keychain")
    {
        ErrorKind::KeyAccessFailure
    } else {
        ErrorKind::Unknown
    };

    match kind {
        ErrorKind::BroadcastRejected => {
            Classification::from(&SendError::broadcast_rejected(raw))
        }
        _ => Classification {
            kind,
            level: kind.severity(),
            message: raw.trim().to_string(),
        },
    }
}
