use std::fmt;

use miniscript::bitcoin::Txid;
use serde::Serialize;

/// How a failure is surfaced to the user.
///
/// `Error` blocks the send action until the underlying condition changes,
/// `Warning` is recoverable and usually retried after a wallet resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Severity::Warning)
    }
}

/// Specific reason a broadcast endpoint refused a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", content = "detail", rename_all = "camelCase")]
pub enum RejectionCause {
    /// The transaction conflicts with one that does not signal replaceability.
    RbfConflict,
    /// The replacement does not pay enough over the transaction it replaces.
    ReplacementFeeTooLow,
    /// An input is already spent in the mempool or in a block.
    MempoolConflict,
    BelowMinRelayFee,
    DustOutput,
    Other(String),
}

impl RejectionCause {
    pub fn message(&self) -> String {
        match self {
            RejectionCause::RbfConflict => {
                "Transaction conflicts with an unconfirmed transaction that cannot be replaced"
                    .to_string()
            }
            RejectionCause::ReplacementFeeTooLow => {
                "Replacement fee is too low, increase the fee rate and try again".to_string()
            }
            RejectionCause::MempoolConflict => {
                "Inputs are already spent by another transaction (double spend)".to_string()
            }
            RejectionCause::BelowMinRelayFee => {
                "Fee is below the minimum relay fee accepted by the network".to_string()
            }
            RejectionCause::DustOutput => "An output is too small to be relayed (dust)".to_string(),
            RejectionCause::Other(reason) => format!("Broadcast rejected: {}", reason),
        }
    }
}

impl fmt::Display for RejectionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Every failure the send pipeline can produce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("No spendable UTXOs available")]
    NoUtxos,
    #[error("Insufficient funds: need {needed} sats, have {available} sats")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("No valid recipients")]
    NoValidRecipients,
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Output of {amount} sats is below the dust threshold of {threshold} sats")]
    DustOutput { amount: u64, threshold: u64 },
    #[error("No change address available")]
    NoChangeAddress,
    #[error("Missing derivation path for address {address}")]
    DerivationPathMissing { address: String },
    #[error("Key access failure: {0}")]
    KeyAccessFailure(String),
    #[error("No local key for fingerprint {fingerprint}")]
    NoLocalKey { fingerprint: String },
    #[error("PSBT input mismatch: {0}")]
    PsbtInputMismatch(String),
    #[error("Invalid PSBT: {0}")]
    InvalidPsbt(String),
    #[error("Insufficient signatures: {present} of {required} required")]
    InsufficientSignatures { present: usize, required: usize },
    #[error("Failed to finalize transaction: {0}")]
    FinalizeFailed(String),
    #[error("{cause}")]
    BroadcastRejected { cause: RejectionCause },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Previous transaction {txid} is unavailable")]
    PreviousTransactionUnavailable { txid: Txid },
    #[error("Invalid multisig configuration: {0}")]
    InvalidMultisigConfig(String),
    #[error("Invalid engine config: {0}")]
    InvalidConfig(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Fieldless mirror of [`SendError`] used by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    NoUtxos,
    InsufficientFunds,
    NoValidRecipients,
    InvalidAddress,
    DustOutput,
    NoChangeAddress,
    DerivationPathMissing,
    KeyAccessFailure,
    NoLocalKey,
    PsbtInputMismatch,
    InvalidPsbt,
    InsufficientSignatures,
    FinalizeFailed,
    BroadcastRejected,
    NetworkError,
    PreviousTransactionUnavailable,
    InvalidMultisigConfig,
    InvalidConfig,
    InvalidState,
    Signing,
    Unknown,
}

impl SendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SendError::NoUtxos => ErrorKind::NoUtxos,
            SendError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            SendError::NoValidRecipients => ErrorKind::NoValidRecipients,
            SendError::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            SendError::DustOutput { .. } => ErrorKind::DustOutput,
            SendError::NoChangeAddress => ErrorKind::NoChangeAddress,
            SendError::DerivationPathMissing { .. } => ErrorKind::DerivationPathMissing,
            SendError::KeyAccessFailure(_) => ErrorKind::KeyAccessFailure,
            SendError::NoLocalKey { .. } => ErrorKind::NoLocalKey,
            SendError::PsbtInputMismatch(_) => ErrorKind::PsbtInputMismatch,
            SendError::InvalidPsbt(_) => ErrorKind::InvalidPsbt,
            SendError::InsufficientSignatures { .. } => ErrorKind::InsufficientSignatures,
            SendError::FinalizeFailed(_) => ErrorKind::FinalizeFailed,
            SendError::BroadcastRejected { .. } => ErrorKind::BroadcastRejected,
            SendError::NetworkError(_) => ErrorKind::NetworkError,
            SendError::PreviousTransactionUnavailable { .. } => {
                ErrorKind::PreviousTransactionUnavailable
            }
            SendError::InvalidMultisigConfig(_) => ErrorKind::InvalidMultisigConfig,
            SendError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SendError::InvalidState(_) => ErrorKind::InvalidState,
            SendError::Signing(_) => ErrorKind::Signing,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SendError::BroadcastRejected { cause } => match cause {
                RejectionCause::ReplacementFeeTooLow | RejectionCause::DustOutput => {
                    Severity::Warning
                }
                _ => Severity::Error,
            },
            other => other.kind().severity(),
        }
    }

    pub fn broadcast_rejected(reason: &str) -> Self {
        SendError::BroadcastRejected {
            cause: crate::classify::humanize_broadcast_rejection(reason),
        }
    }
}

impl ErrorKind {
    /// Default severity for a kind. Broadcast rejections refine this per cause.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::DustOutput
            | ErrorKind::DerivationPathMissing
            | ErrorKind::NetworkError
            | ErrorKind::PreviousTransactionUnavailable => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
