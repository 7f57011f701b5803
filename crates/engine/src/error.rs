//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::expr::ExprError;

/// Errors produced by canvas validation and by the workers.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes of a canvas share the same name.
    #[error("duplicate name: '{0}'")]
    DuplicateName(String),

    /// A connection or mapping references a node that doesn't exist.
    #[error("stage '{stage}' references unknown connection '{connection}'")]
    UnknownConnection { stage: String, connection: String },

    /// Topological sort over stage-to-stage connections detected a cycle.
    #[error("canvas graph contains a cycle")]
    CycleDetected,

    /// A stage definition is malformed.
    #[error("invalid stage '{stage}': {message}")]
    InvalidStage { stage: String, message: String },

    // ------ Per-entity errors ------

    #[error("expression '{expression}' failed: {source}")]
    Expression {
        expression: String,
        #[source]
        source: ExprError,
    },

    /// A required input has no value for this event.
    #[error("missing required input '{0}'")]
    MissingInput(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("secret '{name}': {message}")]
    Secret { name: String, message: String },

    /// The executor spec could not be rendered.
    #[error("template error: {0}")]
    Template(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// The stage-event is not in a state where the action applies.
    #[error("stage event {id} is {state}")]
    InvalidState { id: Uuid, state: String },

    // ------ Collaborator errors ------

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("bus error: {0}")]
    Bus(#[from] bus::BusError),

    #[error("executor error: {0}")]
    Executor(#[from] executors::ExecutorError),
}

impl EngineError {
    /// `true` for faults that should leave state untouched and be retried
    /// on the next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => err.is_transient(),
            Self::Bus(_) => true,
            Self::Executor(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Database(db::DbError::NotFound))
    }
}
