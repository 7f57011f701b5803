//! The `Executor` trait: the contract every executor adapter must fulfil.

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ExecutorError;

/// Identifiers handed to an adapter for one execution.
///
/// Defined here (in the executors crate) so both the engine and individual
/// adapters can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub stage_id: Uuid,
    pub execution_id: Uuid,
    /// Short-lived bearer the external job uses to push outputs and tags back.
    pub token: String,
}

/// What an adapter reports after `execute` or `check`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutorResponse {
    pub finished: bool,
    pub successful: bool,
    pub outputs: Map<String, Value>,
    /// Opaque reference for later polling; empty for synchronous adapters.
    pub reference_id: String,
}

impl ExecutorResponse {
    /// A terminal response.
    pub fn finished(successful: bool, outputs: Map<String, Value>) -> Self {
        Self { finished: true, successful, outputs, reference_id: String::new() }
    }

    /// A response for work still running under `reference_id`.
    pub fn running(reference_id: impl Into<String>) -> Self {
        Self { reference_id: reference_id.into(), ..Self::default() }
    }
}

/// An executor adapter.
///
/// `execute` receives the fully rendered spec (no `${{ }}` tokens left).
/// Synchronous adapters answer with a finished response; asynchronous ones
/// answer with a reference id and are polled through `check`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The spec `type` tag this adapter serves.
    fn name(&self) -> &'static str;

    /// Reject specs that could never be invoked.
    fn validate(&self, spec: &Value) -> Result<(), ExecutorError>;

    async fn execute(
        &self,
        spec: &Value,
        ctx: &ExecutionContext,
    ) -> Result<ExecutorResponse, ExecutorError>;

    async fn check(
        &self,
        _spec: &Value,
        _reference_id: &str,
    ) -> Result<ExecutorResponse, ExecutorError> {
        Err(ExecutorError::Unsupported(self.name()))
    }
}

/// Decode an adapter's typed spec out of the rendered JSON.
pub fn decode_spec<T: serde::de::DeserializeOwned>(spec: &Value) -> Result<T, ExecutorError> {
    serde_json::from_value(spec.clone()).map_err(|e| ExecutorError::InvalidSpec(e.to_string()))
}
