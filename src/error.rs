use std::result;

use thiserror::Error;

/// Custom result type for storage operations
pub type Result<T> = result::Result<T, Error>;

/// Storage error kinds
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Key already exists or a unique index was violated
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// Store, index or record not found
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation called outside of its allowed state
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Operation not allowed, usually a misuse of the API
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// Argument rejected by validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The back end cannot perform this operation
    #[error("not supported: {0}")]
    NotSupported(String),
    /// The transaction was aborted
    #[error("transaction aborted: {0}")]
    Aborted(String),
    /// The transaction has finished and no longer accepts work
    #[error("transaction inactive")]
    TransactionInactive,
    /// Write attempted in a read-only transaction
    #[error("transaction is read-only")]
    ReadOnly,
    /// Back end reported a failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Returns true for errors caused by the calling code rather than the back end.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidState(_) | Error::InvalidOperation(_) | Error::InvalidArgument(_)
        )
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Error {
        Error::InvalidState(msg.into())
    }

    pub(crate) fn invalid_op(msg: impl Into<String>) -> Error {
        Error::InvalidOperation(msg.into())
    }
}
