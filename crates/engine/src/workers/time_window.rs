//! Wakes stage-events parked outside their time window once the window
//! opens.

use std::collections::HashMap;

use tracing::{info, instrument};
use uuid::Uuid;

use db::models::{StageEventRow, StageEventState, StageEventStateReason};

use crate::context::Services;
use crate::models::Stage;
use crate::workers::{log_row_error, next_cursor};
use crate::EngineError;

pub struct TimeWindowListener {
    services: Services,
}

impl TimeWindowListener {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn run(self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.services.config.time_window_interval;
        super::run_periodic("time-window-listener", interval, shutdown, || self.tick()).await;
    }

    /// Walks every parked event, page by page, so a stage with a long
    /// backlog cannot hide the events of other stages.
    pub async fn tick(&self) -> Result<usize, EngineError> {
        let batch_size = self.services.config.batch_size;
        let mut stages: HashMap<Uuid, Stage> = HashMap::new();
        let mut woken = 0;
        let mut after = None;
        loop {
            let events = self
                .services
                .store
                .list_stage_events(
                    None,
                    (StageEventState::Waiting, Some(StageEventStateReason::TimeWindow)),
                    after,
                    batch_size,
                )
                .await?;

            for event in &events {
                match self.wake(event, &mut stages).await {
                    Ok(true) => woken += 1,
                    Ok(false) => {}
                    Err(err) => log_row_error("checking time window", event.id, &err),
                }
            }

            after = next_cursor(&events, batch_size, |e| (e.created_at, e.id));
            if after.is_none() {
                return Ok(woken);
            }
        }
    }

    #[instrument(skip_all, fields(stage_event_id = %event.id, stage_id = %event.stage_id))]
    async fn wake(
        &self,
        event: &StageEventRow,
        stages: &mut HashMap<Uuid, Stage>,
    ) -> Result<bool, EngineError> {
        if !stages.contains_key(&event.stage_id) {
            let row = self.services.store.find_stage(event.stage_id).await?;
            stages.insert(event.stage_id, Stage::try_from(&row)?);
        }
        let Some(stage) = stages.get(&event.stage_id) else {
            return Ok(false);
        };

        let now = self.services.clock.now();
        let offset = self.services.config.time_window_offset;
        for window in stage.time_windows() {
            let inside = window.contains(now, offset).map_err(|e| EngineError::InvalidStage {
                stage: stage.name.clone(),
                message: e.to_string(),
            })?;
            if !inside {
                return Ok(false);
            }
        }

        let moved = self
            .services
            .store
            .transition_stage_event(
                event.id,
                (StageEventState::Waiting, Some(StageEventStateReason::TimeWindow)),
                (StageEventState::Pending, None),
            )
            .await?;
        if moved {
            info!("time window open, stage event pending again");
        }
        Ok(moved)
    }
}
