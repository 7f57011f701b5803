//! The workers that move events through a stage.
//!
//! Every periodic worker exposes a `tick` that does one pass over the rows
//! it owns and returns how many it advanced. `tick` is what the tests
//! drive; `run` wraps it in [`run_periodic`] for the runtime.

pub mod approvals;
pub mod completion;
pub mod dispatcher;
pub mod gates;
pub mod reconciler;
pub mod router;
pub mod time_window;

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use bus::{Bus, Message};
use db::PageCursor;

use crate::EngineError;

pub use approvals::{approve_stage_event, ApprovalListener};
pub use dispatcher::Dispatcher;
pub use gates::GateEvaluator;
pub use reconciler::Reconciler;
pub use router::Router;
pub use time_window::TimeWindowListener;

/// Call `tick` every `interval` until `shutdown` turns true. A tick in
/// flight always runs to completion.
pub async fn run_periodic<F, Fut>(
    worker: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, EngineError>>,
{
    info!(worker, interval_ms = interval.as_millis() as u64, "worker starting");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match tick().await {
            Ok(0) => {}
            Ok(count) => debug!(worker, count, "tick advanced rows"),
            Err(err) if err.is_transient() => warn!(worker, error = %err, "tick failed, retrying next tick"),
            Err(err) => error!(worker, error = %err, "tick failed"),
        }
    }

    info!(worker, "worker stopped");
}

/// Cursor for the page following `page`, or `None` when `page` was the
/// last one.
pub(crate) fn next_cursor<T>(
    page: &[T],
    limit: i64,
    key: impl Fn(&T) -> PageCursor,
) -> Option<PageCursor> {
    if i64::try_from(page.len()).unwrap_or(i64::MAX) < limit {
        return None;
    }
    page.last().map(key)
}

/// Publish a notification. State is already committed when this runs, so
/// a failed publish is logged rather than returned.
pub(crate) async fn publish(bus: &dyn Bus, message: Message) {
    if let Err(err) = bus.publish(&message).await {
        warn!(routing_key = %message.routing_key(), error = %err, "failed to publish message");
    }
}

/// Log a per-row failure without stopping the tick. Transient faults
/// leave the row for the next tick.
pub(crate) fn log_row_error(what: &'static str, id: uuid::Uuid, err: &EngineError) {
    if err.is_transient() {
        warn!(%id, error = %err, "{what}: transient failure, will retry");
    } else if err.is_not_found() {
        info!(%id, "{what}: row vanished, skipping");
    } else {
        error!(%id, error = %err, "{what} failed");
    }
}
