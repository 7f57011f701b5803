//! Gate evaluator: per stage, takes the oldest pending stage-event through
//! the stage's conditions and creates its execution once all pass.

use tracing::{debug, info, instrument};
use uuid::Uuid;

use bus::Message;
use db::models::{ExecutionState, StageEventRow, StageEventState, StageEventStateReason};

use crate::context::Services;
use crate::models::{Condition, Stage};
use crate::workers::{log_row_error, publish};
use crate::EngineError;

pub struct GateEvaluator {
    services: Services,
}

impl GateEvaluator {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn run(self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.services.config.gate_interval;
        super::run_periodic("gate-evaluator", interval, shutdown, || self.tick()).await;
    }

    pub async fn tick(&self) -> Result<usize, EngineError> {
        let stage_ids = self.services.store.stages_with_pending_events().await?;

        let mut advanced = 0;
        for stage_id in stage_ids {
            match self.evaluate_stage(stage_id).await {
                Ok(true) => advanced += 1,
                Ok(false) => {}
                Err(err) => log_row_error("evaluating stage gates", stage_id, &err),
            }
        }
        Ok(advanced)
    }

    /// Evaluate the oldest pending event of one stage.
    #[instrument(skip(self))]
    pub async fn evaluate_stage(&self, stage_id: Uuid) -> Result<bool, EngineError> {
        let store = self.services.store.as_ref();
        let Some(event) = store.oldest_pending_stage_event(stage_id).await? else {
            return Ok(false);
        };

        let busy = store
            .list_executions_for_stage(stage_id)
            .await?
            .iter()
            .any(|x| matches!(x.state, ExecutionState::Pending | ExecutionState::Started));
        if busy {
            debug!(stage_event_id = %event.id, "stage has an active execution");
            return Ok(false);
        }

        let stage = Stage::try_from(&store.find_stage(stage_id).await?)?;

        if let Some(reason) = self.blocking_condition(&stage, &event).await? {
            let moved = store
                .transition_stage_event(
                    event.id,
                    (StageEventState::Pending, None),
                    (StageEventState::Waiting, Some(reason)),
                )
                .await?;
            if moved {
                info!(stage_event_id = %event.id, %reason, "stage event waiting");
            }
            return Ok(moved);
        }

        let Some(execution) = store.create_execution(event.id).await? else {
            debug!(stage_event_id = %event.id, "event claimed elsewhere or stage busy");
            return Ok(false);
        };

        info!(
            canvas_id = %stage.canvas_id,
            stage_event_id = %event.id,
            execution_id = %execution.id,
            "execution created"
        );
        publish(
            self.services.bus.as_ref(),
            Message::ExecutionCreated {
                canvas_id: stage.canvas_id,
                stage_id: stage.id,
                stage_event_id: event.id,
                execution_id: execution.id,
                timestamp: execution.created_at,
            },
        )
        .await;
        Ok(true)
    }

    /// The first condition, in declaration order, that does not pass.
    async fn blocking_condition(
        &self,
        stage: &Stage,
        event: &StageEventRow,
    ) -> Result<Option<StageEventStateReason>, EngineError> {
        for condition in &stage.conditions {
            match condition {
                Condition::Approval { count } => {
                    let approvals = self.services.store.count_approvals(event.id).await?;
                    if approvals < i64::from(*count) {
                        debug!(stage_event_id = %event.id, approvals, required = *count, "not enough approvals");
                        return Ok(Some(StageEventStateReason::Approval));
                    }
                }
                Condition::TimeWindow(window) => {
                    let inside = window
                        .contains(self.services.clock.now(), self.services.config.time_window_offset)
                        .map_err(|e| EngineError::InvalidStage {
                            stage: stage.name.clone(),
                            message: e.to_string(),
                        })?;
                    if !inside {
                        return Ok(Some(StageEventStateReason::TimeWindow));
                    }
                }
            }
        }
        Ok(None)
    }
}
