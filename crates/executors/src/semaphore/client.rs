//! Minimal client for the Semaphore CI API: trigger a task, then follow the
//! resulting workflow to its pipeline.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ExecutorError;

#[derive(Debug, Clone, Serialize)]
pub struct TaskTriggerParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskTriggerSpec {
    pub branch: String,
    pub pipeline_file: String,
    pub parameters: Vec<TaskTriggerParameter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pipeline {
    #[serde(rename = "ppl_id", default)]
    pub id: String,
    #[serde(rename = "wf_id", default)]
    pub workflow_id: String,
    pub state: String,
    #[serde(default)]
    pub result: String,
}

pub const PIPELINE_STATE_DONE: &str = "done";
pub const PIPELINE_RESULT_PASSED: &str = "passed";

pub struct SemaphoreClient<'a> {
    http: &'a reqwest::Client,
    base_url: &'a str,
    token: &'a str,
}

impl<'a> SemaphoreClient<'a> {
    pub fn new(http: &'a reqwest::Client, base_url: &'a str, token: &'a str) -> Self {
        Self { http, base_url: base_url.trim_end_matches('/'), token }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, ExecutorError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            let error = format!("request got {status}: {body}");
            return Err(if status.is_server_error() {
                ExecutorError::Transient(error)
            } else {
                ExecutorError::Rejected(error)
            });
        }
        serde_json::from_str(&body)
            .map_err(|e| ExecutorError::Rejected(format!("malformed response: {e}")))
    }

    /// Trigger a task run and return the id of the workflow it created.
    pub async fn trigger_task(
        &self,
        project_id: &str,
        task_id: &str,
        spec: TaskTriggerSpec,
    ) -> Result<String, ExecutorError> {
        let body = serde_json::json!({
            "kind": "TaskTrigger",
            "apiVersion": "v2",
            "spec": spec,
        });
        let response = self
            .send(
                self.request(
                    Method::POST,
                    &format!("/api/v2/projects/{project_id}/tasks/{task_id}/triggers"),
                )
                .json(&body),
            )
            .await?;

        let metadata = &response["metadata"];
        let status = metadata["status"].as_str().unwrap_or_default();
        if status != "PASSED" {
            return Err(ExecutorError::Rejected(format!("trigger status was '{status}'")));
        }
        metadata["workflow_id"]
            .as_str()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::Rejected("trigger response has no workflow id".into()))
    }

    /// Id of the first pipeline of a workflow.
    pub async fn initial_pipeline_id(&self, workflow_id: &str) -> Result<String, ExecutorError> {
        let response = self
            .send(self.request(Method::GET, &format!("/api/v2/workflows/{workflow_id}")))
            .await?;
        response["initial_ppl_id"]
            .as_str()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::Rejected("workflow has no initial pipeline".into()))
    }

    pub async fn describe_pipeline(&self, pipeline_id: &str) -> Result<Pipeline, ExecutorError> {
        let mut response = self
            .send(self.request(Method::GET, &format!("/api/v1alpha/pipelines/{pipeline_id}")))
            .await?;
        serde_json::from_value(response["pipeline"].take())
            .map_err(|e| ExecutorError::Rejected(format!("malformed pipeline: {e}")))
    }
}
