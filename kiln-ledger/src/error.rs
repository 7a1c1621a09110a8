use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u64, need: u64 },

    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Storage error: {reason}")]
    Storage { reason: String },
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Storage {
            reason: err.to_string(),
        }
    }
}
