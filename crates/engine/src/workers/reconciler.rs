//! Async reconciler: polls the adapters of started asynchronous
//! executions and finishes the ones that are done.

use chrono::Duration;
use tracing::{debug, instrument, warn};

use db::models::{ExecutionState, StageExecutionRow};

use crate::context::Services;
use crate::models::Stage;
use crate::workers::dispatcher::rendered_spec;
use crate::workers::{completion, log_row_error, next_cursor};
use crate::EngineError;

pub struct Reconciler {
    services: Services,
}

impl Reconciler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn run(self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.services.config.reconciler_interval;
        super::run_periodic("reconciler", interval, shutdown, || self.tick()).await;
    }

    /// Polls every started execution, page by page.
    pub async fn tick(&self) -> Result<usize, EngineError> {
        let batch_size = self.services.config.batch_size;
        let mut finished = 0;
        let mut after = None;
        loop {
            let executions = self
                .services
                .store
                .list_executions(ExecutionState::Started, after, batch_size)
                .await?;

            for execution in &executions {
                let outcome = match execution.reference_id.as_deref() {
                    Some(reference_id) => self.poll(execution, reference_id).await,
                    None => self.reap_orphan(execution).await,
                };
                match outcome {
                    Ok(true) => finished += 1,
                    Ok(false) => {}
                    Err(err) => log_row_error("reconciling execution", execution.id, &err),
                }
            }

            after = next_cursor(&executions, batch_size, |x| (x.created_at, x.id));
            if after.is_none() {
                return Ok(finished);
            }
        }
    }

    /// Ask the adapter whether the work is done. Adapter errors leave the
    /// execution for the next tick.
    #[instrument(skip_all, fields(execution_id = %execution.id, reference_id = %reference_id))]
    async fn poll(
        &self,
        execution: &StageExecutionRow,
        reference_id: &str,
    ) -> Result<bool, EngineError> {
        let stage = Stage::try_from(&self.services.store.find_stage(execution.stage_id).await?)?;
        let spec = rendered_spec(&self.services, &stage, execution).await?;
        let executor = self.services.executors.for_spec(&spec)?;

        let response = match executor.check(&spec, reference_id).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "executor check failed, retrying next tick");
                return Ok(false);
            }
        };
        if !response.finished {
            debug!("execution still running");
            return Ok(false);
        }

        let finished = completion::finish(
            &self.services,
            &stage,
            execution.id,
            response.successful,
            response.outputs,
        )
        .await?;
        Ok(finished.is_some())
    }

    /// A started execution without a reference id was lost between claim
    /// and invocation. Fail it once it is older than the orphan timeout so
    /// its stage can move on.
    async fn reap_orphan(&self, execution: &StageExecutionRow) -> Result<bool, EngineError> {
        let Some(started_at) = execution.started_at else {
            return Ok(false);
        };
        let timeout = Duration::from_std(self.services.config.orphan_timeout)
            .unwrap_or_else(|_| Duration::minutes(10));
        if self.services.clock.now() - started_at < timeout {
            return Ok(false);
        }

        warn!(execution_id = %execution.id, %started_at, "failing orphaned execution");
        let stage = Stage::try_from(&self.services.store.find_stage(execution.stage_id).await?)?;
        let finished =
            completion::finish(&self.services, &stage, execution.id, false, Default::default())
                .await?;
        Ok(finished.is_some())
    }
}
