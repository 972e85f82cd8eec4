//! Error taxonomy for the client core.
//!
//! `AlreadyInProgress` and `Debounced` are local, expected-and-frequent
//! rejections; callers should treat them as "do nothing" rather than as
//! failures worth surfacing to the end user.

use thiserror::Error;

/// Errors produced by the operation serializer, the connection manager and
/// the reconciliation ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("an operation of this kind is already in progress")]
    AlreadyInProgress,

    #[error("trigger arrived within the debounce window of a previous one")]
    Debounced,

    #[error("no confirmation arrived within the configured window")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("outbound queue is at capacity")]
    QueueFull,
}

impl OperationError {
    /// Whether this error is a local admission rejection rather than a
    /// genuine failure of the operation itself.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OperationError::AlreadyInProgress | OperationError::Debounced
        )
    }
}
