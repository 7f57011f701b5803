//! `executors` crate: the adapters that run a stage's work elsewhere.
//!
//! Every adapter implements [`Executor`]. The [`ExecutorRegistry`] selects
//! one by the `type` tag of a stage's executor spec.

pub mod error;
pub mod http;
pub mod mock;
pub mod registry;
pub mod semaphore;
pub mod traits;

pub use error::ExecutorError;
pub use http::HttpExecutor;
pub use registry::ExecutorRegistry;
pub use semaphore::SemaphoreExecutor;
pub use traits::{ExecutionContext, Executor, ExecutorResponse};
