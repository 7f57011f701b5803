//! `api` crate: public HTTP surface.
//!
//! Routes:
//!   POST /sources/:source_id/:provider   signed webhook intake
//!   POST /executions/:id/outputs         outputs pushed by a running job
//!   POST /executions/:id/tags            tags pushed by a running job
//!   GET  /health

pub mod error;
pub mod handlers;
pub mod signature;
pub mod state;

use std::future::Future;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ApiError;
pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health::health))
        .route("/health", get(handlers::health::health))
        .route("/sources/:source_id/:provider", post(handlers::webhooks::receive_event))
        .route("/executions/:id/outputs", post(handlers::executions::push_outputs))
        .route("/executions/:id/tags", post(handlers::executions::push_tags))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn serve<F>(bind: &str, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await
}
