use thiserror::Error;

use kiln_ledger::LedgerError;

/// Errors that can occur in the execution engine.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Contract not found: {address:?}")]
    ContractNotFound { address: [u8; 20] },

    #[error("Out of gas: requested {requested} with {remaining} remaining ({used} used)")]
    OutOfGas {
        requested: u64,
        remaining: u64,
        used: u64,
    },

    #[error("Invalid refund: {requested} exceeds {used} used")]
    InvalidRefund { requested: u64, used: u64 },

    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("Instrumentation failed: {reason}")]
    Instrumentation { reason: String },

    #[error("Runtime error: {reason}")]
    Runtime { reason: String },

    #[error("Contract failed: {message}")]
    Contract { message: String },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}
