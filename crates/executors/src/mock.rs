//! `MockExecutor`: a test double for `Executor`.
//!
//! Useful in engine tests where a real adapter is either unavailable or
//! irrelevant.  Registered under any tag; records every spec it receives.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::{ExecutionContext, Executor, ExecutorError, ExecutorResponse};

/// Behaviour injected into `MockExecutor` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Answer synchronously.
    Finish { successful: bool, outputs: Map<String, Value> },
    /// Start asynchronous work under a reference id.
    Start { reference_id: String },
    /// Fail the invocation.
    Fail(ExecutorError),
}

pub struct MockExecutor {
    name: &'static str,
    behaviour: MockBehaviour,
    /// Answers handed out by `check`, in order; once drained, `check`
    /// reports the work as still running.
    checks: Mutex<VecDeque<Result<ExecutorResponse, ExecutorError>>>,
    /// Every rendered spec passed to `execute`, in call order.
    pub calls: Arc<Mutex<Vec<Value>>>,
    /// Every context passed to `execute`, in call order.
    pub contexts: Arc<Mutex<Vec<ExecutionContext>>>,
}

impl MockExecutor {
    pub fn new(name: &'static str, behaviour: MockBehaviour) -> Self {
        Self {
            name,
            behaviour,
            checks: Mutex::new(VecDeque::new()),
            calls: Arc::default(),
            contexts: Arc::default(),
        }
    }

    /// A mock that finishes inline with the given outcome.
    pub fn finishing(name: &'static str, successful: bool, outputs: Value) -> Self {
        let outputs = match outputs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(name, MockBehaviour::Finish { successful, outputs })
    }

    /// A mock that starts asynchronous work.
    pub fn starting(name: &'static str, reference_id: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::Start { reference_id: reference_id.into() })
    }

    /// A mock whose invocation fails.
    pub fn failing(name: &'static str, error: ExecutorError) -> Self {
        Self::new(name, MockBehaviour::Fail(error))
    }

    /// Queue the next answer of `check`.
    pub fn push_check(&self, answer: Result<ExecutorResponse, ExecutorError>) {
        self.checks.lock().push_back(answer);
    }

    /// Number of times `execute` was called.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(&self, _spec: &Value) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn execute(
        &self,
        spec: &Value,
        ctx: &ExecutionContext,
    ) -> Result<ExecutorResponse, ExecutorError> {
        self.calls.lock().push(spec.clone());
        self.contexts.lock().push(ctx.clone());

        match &self.behaviour {
            MockBehaviour::Finish { successful, outputs } => {
                Ok(ExecutorResponse::finished(*successful, outputs.clone()))
            }
            MockBehaviour::Start { reference_id } => Ok(ExecutorResponse::running(reference_id)),
            MockBehaviour::Fail(err) => Err(err.clone()),
        }
    }

    async fn check(
        &self,
        _spec: &Value,
        reference_id: &str,
    ) -> Result<ExecutorResponse, ExecutorError> {
        self.checks
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecutorResponse::running(reference_id)))
    }
}
