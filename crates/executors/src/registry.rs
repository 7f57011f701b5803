//! Maps spec `type` tags to executor adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::{Executor, ExecutorError, HttpExecutor, SemaphoreExecutor};

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    adapters: HashMap<&'static str, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in HTTP and Semaphore adapters.
    pub fn with_builtin(timeout: Duration) -> Result<Self, ExecutorError> {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpExecutor::new(timeout)?));
        registry.register(Arc::new(SemaphoreExecutor::new(timeout)?));
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn Executor>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    /// The adapter for a spec, chosen by its `type` field.
    pub fn for_spec(&self, spec: &Value) -> Result<Arc<dyn Executor>, ExecutorError> {
        let kind = spec
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::InvalidSpec("missing executor type".into()))?;
        self.adapters
            .get(kind)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownType(kind.to_string()))
    }

    /// Validate a spec with the adapter its tag selects.
    pub fn validate(&self, spec: &Value) -> Result<(), ExecutorError> {
        self.for_spec(spec)?.validate(spec)
    }
}
