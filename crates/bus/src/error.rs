//! Bus error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("malformed bus message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The subscriber side went away.
    #[error("subscription closed")]
    Closed,
}
