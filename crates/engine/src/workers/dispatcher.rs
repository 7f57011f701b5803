//! Execution dispatcher: starts pending executions by rendering the
//! stage's executor spec and invoking its adapter.

use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument};

use bus::Message;
use db::models::{ExecutionState, StageExecutionRow};
use executors::{ExecutionContext, ExecutorResponse};

use crate::context::Services;
use crate::models::Stage;
use crate::secrets;
use crate::template::{self, TemplateContext};
use crate::workers::{completion, log_row_error, next_cursor, publish};
use crate::EngineError;

pub struct Dispatcher {
    services: Services,
}

impl Dispatcher {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn run(self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.services.config.dispatcher_interval;
        super::run_periodic("dispatcher", interval, shutdown, || self.tick()).await;
    }

    pub async fn tick(&self) -> Result<usize, EngineError> {
        let batch_size = self.services.config.batch_size;
        let mut dispatched = 0;
        let mut after = None;
        loop {
            let executions = self
                .services
                .store
                .list_executions(ExecutionState::Pending, after, batch_size)
                .await?;

            for execution in &executions {
                match self.dispatch(execution).await {
                    Ok(true) => dispatched += 1,
                    Ok(false) => {}
                    Err(err) => log_row_error("dispatching execution", execution.id, &err),
                }
            }

            after = next_cursor(&executions, batch_size, |x| (x.created_at, x.id));
            if after.is_none() {
                return Ok(dispatched);
            }
        }
    }

    /// Claim and start one execution. Returns `false` if another
    /// dispatcher claimed it first.
    #[instrument(skip_all, fields(execution_id = %execution.id, stage_id = %execution.stage_id))]
    pub async fn dispatch(&self, execution: &StageExecutionRow) -> Result<bool, EngineError> {
        let store = self.services.store.as_ref();
        let stage = Stage::try_from(&store.find_stage(execution.stage_id).await?)?;

        let Some(execution) = store.start_execution(execution.id, self.services.clock.now()).await?
        else {
            debug!("execution claimed elsewhere");
            return Ok(false);
        };

        match self.invoke(&stage, &execution).await {
            Ok(response) if response.finished => {
                completion::finish(
                    &self.services,
                    &stage,
                    execution.id,
                    response.successful,
                    response.outputs,
                )
                .await?;
            }
            Ok(response) => {
                store.set_execution_reference(execution.id, &response.reference_id).await?;
                info!(reference_id = %response.reference_id, "execution started");
                publish(
                    self.services.bus.as_ref(),
                    Message::ExecutionStarted {
                        canvas_id: stage.canvas_id,
                        stage_id: stage.id,
                        execution_id: execution.id,
                        timestamp: execution.started_at.unwrap_or_else(|| self.services.clock.now()),
                    },
                )
                .await;
            }
            Err(err) => {
                error!(error = %err, "execution could not be started");
                completion::finish(&self.services, &stage, execution.id, false, Map::new()).await?;
            }
        }
        Ok(true)
    }

    async fn invoke(
        &self,
        stage: &Stage,
        execution: &StageExecutionRow,
    ) -> Result<ExecutorResponse, EngineError> {
        let spec = rendered_spec(&self.services, stage, execution).await?;
        let executor = self.services.executors.for_spec(&spec)?;
        executor.validate(&spec)?;

        let token = self.services.signer.generate(
            &execution.id.to_string(),
            self.services.clock.now(),
            self.services.config.token_lifetime,
        )?;
        let ctx = ExecutionContext { stage_id: stage.id, execution_id: execution.id, token };

        let response = executor.execute(&spec, &ctx).await?;
        if !response.finished && response.reference_id.is_empty() {
            return Err(EngineError::Executor(executors::ExecutorError::Rejected(
                "asynchronous response without a reference id".into(),
            )));
        }
        Ok(response)
    }
}

/// The stage's executor spec rendered against the event's inputs and the
/// stage's secrets. Secrets are decrypted on every call.
pub(crate) async fn rendered_spec(
    services: &Services,
    stage: &Stage,
    execution: &StageExecutionRow,
) -> Result<Value, EngineError> {
    let event = services.store.find_stage_event(execution.stage_event_id).await?;
    let inputs = event.inputs.as_object().cloned().unwrap_or_default();
    let secrets =
        secrets::resolve_stage_secrets(services.store.as_ref(), services.encryptor.as_ref(), stage)
            .await?;
    template::render(&stage.executor_spec, &TemplateContext::new(inputs, secrets))
}
