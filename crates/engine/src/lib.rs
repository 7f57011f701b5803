//! `engine` crate: stage definitions, canvas validation and the workers
//! that move events through a canvas.
//!
//! Raw events enter through [`workers::Router`], become stage-events, pass
//! the gates of their stage, and run on an executor. Finished executions
//! emit a completion event that re-enters the router, which is how
//! downstream stages are triggered.

pub mod canvas;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod expr;
pub mod filters;
pub mod inputs;
pub mod models;
pub mod runtime;
pub mod secrets;
pub mod template;
pub mod timewindow;
pub mod token;
pub mod workers;

pub use canvas::{apply_canvas, validate_canvas, AppliedCanvas, CanvasFile};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::EngineConfig;
pub use context::Services;
pub use error::EngineError;
pub use models::{Stage, StageDefinition};
pub use runtime::{Runtime, WorkerSet};
pub use secrets::{Encryptor, NoOpEncryptor};
pub use token::TokenSigner;
pub use workers::approve_stage_event;

#[cfg(test)]
mod scenario_tests;
