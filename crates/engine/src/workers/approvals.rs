//! Approvals: the approve action and the listener that unparks a
//! stage-event once it has collected enough of them.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use bus::retry::with_constant_wait;
use bus::{Bus, Message, RoutingKey, Subscription};
use db::models::{ApprovalRow, StageEventState, StageEventStateReason};
use db::Store;

use crate::context::Services;
use crate::models::Stage;
use crate::workers::{log_row_error, next_cursor, publish};
use crate::EngineError;

const SUBSCRIBE_ATTEMPTS: u32 = 5;
const SUBSCRIBE_WAIT: Duration = Duration::from_secs(1);

/// Record `requester_id`'s approval of a stage-event and announce it.
///
/// Approvals cannot be withdrawn. Approving a processed event fails with
/// [`EngineError::InvalidState`]; approving twice fails with
/// `DbError::AlreadyApproved`.
pub async fn approve_stage_event(
    store: &dyn Store,
    bus: &dyn Bus,
    stage_event_id: Uuid,
    requester_id: Uuid,
) -> Result<ApprovalRow, EngineError> {
    let event = store.find_stage_event(stage_event_id).await?;
    if event.state == StageEventState::Processed {
        return Err(EngineError::InvalidState { id: event.id, state: event.state.to_string() });
    }
    let stage = store.find_stage(event.stage_id).await?;

    let approval = store.create_approval(stage_event_id, requester_id).await?;
    info!(%stage_event_id, %requester_id, "stage event approved");

    publish(
        bus,
        Message::StageEventApproved {
            canvas_id: stage.canvas_id,
            stage_id: stage.id,
            stage_event_id,
            requester_id,
            timestamp: approval.approved_at,
        },
    )
    .await;
    Ok(approval)
}

pub struct ApprovalListener {
    services: Services,
}

impl ApprovalListener {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Consume `stage-event-approved` until shutdown, resubscribing when
    /// the bus drops the subscription. Notifications can be lost, so every
    /// subscription starts with a sweep and sweeps again periodically.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = "approval-listener", "worker starting");
        while !*shutdown.borrow() {
            let mut subscription = match self.subscribe().await {
                Ok(subscription) => subscription,
                Err(err) => {
                    error!(error = %err, "could not subscribe to approvals");
                    tokio::select! {
                        _ = tokio::time::sleep(SUBSCRIBE_WAIT) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            let mut sweeps = tokio::time::interval(self.services.config.approval_sweep_interval);
            sweeps.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = sweeps.tick() => {
                        if let Err(err) = self.sweep().await {
                            warn!(error = %err, "approval sweep failed");
                        }
                    }
                    message = subscription.recv() => match message {
                        Some(Message::StageEventApproved { stage_event_id, .. }) => {
                            if let Err(err) = self.handle(stage_event_id).await {
                                warn!(%stage_event_id, error = %err, "failed to handle approval");
                            }
                        }
                        Some(other) => debug!(routing_key = %other.routing_key(), "ignoring message"),
                        None => {
                            warn!("approval subscription closed, resubscribing");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(worker = "approval-listener", "worker stopped");
                            return;
                        }
                    }
                }
            }
        }
        info!(worker = "approval-listener", "worker stopped");
    }

    async fn subscribe(&self) -> Result<Subscription, bus::BusError> {
        let bus = self.services.bus.clone();
        with_constant_wait(SUBSCRIBE_ATTEMPTS, SUBSCRIBE_WAIT, || {
            let bus = bus.clone();
            async move { bus.subscribe(&[RoutingKey::StageEventApproved]).await }
        })
        .await
    }

    /// Run [`Self::handle`] for every event waiting for approval. Returns how
    /// many went back to `pending`.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let batch_size = self.services.config.batch_size;
        let mut released = 0;
        let mut after = None;
        loop {
            let events = self
                .services
                .store
                .list_stage_events(
                    None,
                    (StageEventState::Waiting, Some(StageEventStateReason::Approval)),
                    after,
                    batch_size,
                )
                .await?;

            for event in &events {
                match self.handle(event.id).await {
                    Ok(true) => released += 1,
                    Ok(false) => {}
                    Err(err) => log_row_error("sweeping approvals", event.id, &err),
                }
            }

            after = next_cursor(&events, batch_size, |e| (e.created_at, e.id));
            if after.is_none() {
                return Ok(released);
            }
        }
    }

    /// Move the event back to `pending` if it now has enough approvals.
    /// Safe to call any number of times for the same event.
    #[instrument(skip(self))]
    pub async fn handle(&self, stage_event_id: Uuid) -> Result<bool, EngineError> {
        let store = self.services.store.as_ref();
        let event = match store.find_stage_event(stage_event_id).await {
            Ok(event) => event,
            Err(db::DbError::NotFound) => {
                debug!("stage event not found");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        let waiting_approval = (StageEventState::Waiting, Some(StageEventStateReason::Approval));
        if event.status() != waiting_approval {
            debug!(state = %event.state, "stage event is not waiting for approval");
            return Ok(false);
        }

        let stage = Stage::try_from(&store.find_stage(event.stage_id).await?)?;
        let Some(required) = stage.approval_count() else {
            debug!("stage has no approval condition");
            return Ok(false);
        };

        let approvals = store.count_approvals(event.id).await?;
        if approvals < i64::from(required) {
            debug!(approvals, required, "not enough approvals yet");
            return Ok(false);
        }

        let moved = store
            .transition_stage_event(event.id, waiting_approval, (StageEventState::Pending, None))
            .await?;
        if moved {
            info!(approvals, "approvals reached, stage event pending again");
        }
        Ok(moved)
    }
}
