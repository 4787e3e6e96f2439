use ledger::LedgerError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing input, rejected before the store is touched.
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    /// The entity exists but is not in the state the transition requires.
    #[error("{kind} {id} is not {expected}")]
    InvalidState {
        kind: String,
        id: String,
        expected: String,
    },
    #[error("Store error: {0}")]
    Store(LedgerError),
    #[error("Oracle error: {0}")]
    Oracle(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(kind: &str, id: impl ToString, expected: &str) -> Self {
        Error::InvalidState {
            kind: kind.to_string(),
            id: id.to_string(),
            expected: expected.to_string(),
        }
    }

    /// Whether the same request may succeed if sent again unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(err) => err.is_transient() || matches!(err, LedgerError::Conflict(_)),
            Error::Oracle(_) => true,
            _ => false,
        }
    }
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds => Error::InsufficientFunds,
            LedgerError::Overflow => Error::validation("amount out of range"),
            LedgerError::GuardFailed { kind, id, expected } => {
                Error::InvalidState { kind, id, expected }
            }
            other => Error::Store(other),
        }
    }
}
