pub mod address;
pub mod builder;
pub mod classify;
pub mod collaborators;
pub mod config;
pub mod dimensions;
pub mod engine;
mod error;
pub mod keys;
pub mod logging;
pub mod multisig;
mod networks;
pub mod policy;
pub mod psbt;
pub mod selection;
#[cfg(test)]
mod test_utils;
pub mod types;

// re-export bitcoin from the miniscript crate so hosts see the same types we use
pub use ::miniscript::bitcoin;

pub use builder::{BuiltTransaction, TransactionBuilder, TransactionPlan};
pub use classify::{classify, humanize_broadcast_rejection, Classification};
pub use config::EngineConfig;
pub use engine::{SendAttempt, SendOutcome};
pub use error::{ErrorKind, RejectionCause, SendError, Severity};
pub use multisig::{
    coordinator::{CoordinatorState, ImportOutcome, MultisigCoordinator},
    Cosigner, MultisigConfig, MultisigScriptType, SignatureStatus,
};
pub use networks::Network;
pub use types::{FeeEstimates, FeeTier, Recipient, Utxo, WalletCapability};

pub mod wasm;
pub use wasm::{WasmPsbtTools, WasmSpendError, WasmSpendUtils};
