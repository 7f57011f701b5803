//! Asynchronous executor: triggers a Semaphore task and is polled until the
//! pipeline it started is done.

mod client;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, instrument};

pub use client::{Pipeline, SemaphoreClient, TaskTriggerParameter, TaskTriggerSpec};
use client::{PIPELINE_RESULT_PASSED, PIPELINE_STATE_DONE};

use crate::traits::decode_spec;
use crate::{ExecutionContext, Executor, ExecutorError, ExecutorResponse};

pub const STAGE_ID_PARAMETER: &str = "SEMAPHORE_STAGE_ID";
pub const EXECUTION_ID_PARAMETER: &str = "SEMAPHORE_STAGE_EXECUTION_ID";
pub const EXECUTION_TOKEN_PARAMETER: &str = "SEMAPHORE_STAGE_EXECUTION_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct SemaphoreSpec {
    pub organization_url: String,
    pub api_token: String,
    pub project_id: String,
    pub task_id: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_pipeline_file")]
    pub pipeline_file: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn default_branch() -> String {
    "main".into()
}

fn default_pipeline_file() -> String {
    ".semaphore/semaphore.yml".into()
}

impl SemaphoreSpec {
    fn check(&self) -> Result<(), ExecutorError> {
        for (field, value) in [
            ("organization_url", &self.organization_url),
            ("api_token", &self.api_token),
            ("project_id", &self.project_id),
            ("task_id", &self.task_id),
        ] {
            if value.trim().is_empty() {
                return Err(ExecutorError::InvalidSpec(format!("{field} is required")));
            }
        }
        Ok(())
    }
}

pub struct SemaphoreExecutor {
    http: reqwest::Client,
}

impl SemaphoreExecutor {
    pub fn new(timeout: Duration) -> Result<Self, ExecutorError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Executor for SemaphoreExecutor {
    fn name(&self) -> &'static str {
        "semaphore"
    }

    fn validate(&self, spec: &Value) -> Result<(), ExecutorError> {
        decode_spec::<SemaphoreSpec>(spec)?.check()
    }

    #[instrument(skip_all, fields(execution_id = %ctx.execution_id))]
    async fn execute(
        &self,
        spec: &Value,
        ctx: &ExecutionContext,
    ) -> Result<ExecutorResponse, ExecutorError> {
        let spec: SemaphoreSpec = decode_spec(spec)?;
        spec.check()?;

        let mut parameters = spec.parameters.clone();
        parameters.insert(STAGE_ID_PARAMETER.into(), ctx.stage_id.to_string());
        parameters.insert(EXECUTION_ID_PARAMETER.into(), ctx.execution_id.to_string());
        parameters.insert(EXECUTION_TOKEN_PARAMETER.into(), ctx.token.clone());

        let trigger = TaskTriggerSpec {
            branch: spec.branch.clone(),
            pipeline_file: spec.pipeline_file.clone(),
            parameters: parameters
                .into_iter()
                .map(|(name, value)| TaskTriggerParameter { name, value })
                .collect(),
        };

        let client = SemaphoreClient::new(&self.http, &spec.organization_url, &spec.api_token);
        let workflow_id = client.trigger_task(&spec.project_id, &spec.task_id, trigger).await?;
        info!(%workflow_id, "semaphore task triggered");
        Ok(ExecutorResponse::running(workflow_id))
    }

    #[instrument(skip(self, spec))]
    async fn check(
        &self,
        spec: &Value,
        reference_id: &str,
    ) -> Result<ExecutorResponse, ExecutorError> {
        let spec: SemaphoreSpec = decode_spec(spec)?;
        let client = SemaphoreClient::new(&self.http, &spec.organization_url, &spec.api_token);

        let pipeline_id = client.initial_pipeline_id(reference_id).await?;
        let pipeline = client.describe_pipeline(&pipeline_id).await?;

        if !pipeline.state.eq_ignore_ascii_case(PIPELINE_STATE_DONE) {
            return Ok(ExecutorResponse::running(reference_id));
        }

        let successful = pipeline.result.eq_ignore_ascii_case(PIPELINE_RESULT_PASSED);
        Ok(ExecutorResponse {
            reference_id: reference_id.to_string(),
            ..ExecutorResponse::finished(successful, Map::new())
        })
    }
}
