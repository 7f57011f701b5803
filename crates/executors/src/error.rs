//! Executor-level error type.

use thiserror::Error;

/// Errors returned by an executor's `execute` / `check`.
///
/// The engine uses the variant to decide what happens next:
/// - at dispatch, any error finishes the execution as failed;
/// - while polling, `Transient` is retried on the next tick and every other
///   variant is logged and retried as well, since nothing has been finalized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// Network failure or timeout talking to the external system.
    #[error("transient executor error: {0}")]
    Transient(String),

    /// The external system answered but refused the request.
    #[error("executor request rejected: {0}")]
    Rejected(String),

    /// The rendered spec does not describe a valid invocation.
    #[error("invalid executor spec: {0}")]
    InvalidSpec(String),

    /// No adapter is registered for the spec's `type` tag.
    #[error("unknown executor type '{0}'")]
    UnknownType(String),

    /// The adapter does not support the requested operation.
    #[error("{0} executor does not support polling")]
    Unsupported(&'static str),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Rejected(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}
