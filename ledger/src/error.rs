// ledger/src/error.rs

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Invalid amount")]
    InvalidAmount,
    /// A balance column would leave the representable range.
    #[error("Amount overflow")]
    Overflow,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Guard failed: {kind} {id} is not {expected}")]
    GuardFailed {
        kind: String,
        id: String,
        expected: String,
    },
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Whether retrying the same plan could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                LedgerError::Conflict(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_check_violation() => LedgerError::InsufficientFunds,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                LedgerError::Corrupt(err.to_string())
            }
            _ => LedgerError::Storage(err.to_string()),
        }
    }
}
