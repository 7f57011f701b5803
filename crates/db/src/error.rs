//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The requester already approved this stage-event.
    #[error("stage event already approved by requester")]
    AlreadyApproved,

    /// The execution already finished and no longer takes updates.
    #[error("execution already finished")]
    ExecutionFinished,

    /// A name that must be unique within its scope is taken.
    #[error("{0} already exists")]
    Duplicate(String),

    /// A stored column held a value that does not map onto its enum.
    #[error("invalid column value: {0}")]
    InvalidColumn(String),
}

impl DbError {
    /// `true` for faults that may succeed on a later attempt (connection
    /// drops, serialization failures, pool timeouts).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Sqlx(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Database(_)
            )
        )
    }
}
