//! `db` crate: pure persistence layer.
//!
//! Provides a connection pool, typed row structs, the [`Store`] trait that
//! groups every transactional unit of work the engine needs, and two
//! implementations of it: [`PgStore`] over Postgres and [`MemoryStore`] for
//! tests and single-process runs.  No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pool::DbPool;
pub use repository::PgStore;
pub use store::{
    FinishExecution, NewCanvas, NewEventSource, NewRawEvent, NewSecret, NewStage,
    NewStageEvent, PageCursor, RoutingOutcome, Store,
};
