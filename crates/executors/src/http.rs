//! Synchronous HTTP executor: one POST, answered inline.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::traits::decode_spec;
use crate::{ExecutionContext, Executor, ExecutorError, ExecutorResponse};

/// Response bodies are read up to this many bytes.
pub const MAX_RESPONSE_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSpec {
    pub url: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub response_policy: ResponsePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePolicy {
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<u16>,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self { status_codes: default_status_codes() }
    }
}

fn default_status_codes() -> Vec<u16> {
    vec![200]
}

impl HttpSpec {
    fn check(&self) -> Result<Url, ExecutorError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ExecutorError::InvalidSpec(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExecutorError::InvalidSpec(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        if let Some(code) =
            self.response_policy.status_codes.iter().find(|c| !(200..=511).contains(*c))
        {
            return Err(ExecutorError::InvalidSpec(format!(
                "status code {code} outside 200-511"
            )));
        }
        Ok(url)
    }
}

pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(timeout: Duration) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// Read at most `limit` bytes of the body; the rest is ignored.
async fn read_capped(mut response: reqwest::Response, limit: usize) -> Result<Vec<u8>, ExecutorError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &'static str {
        "http"
    }

    fn validate(&self, spec: &Value) -> Result<(), ExecutorError> {
        decode_spec::<HttpSpec>(spec)?.check().map(|_| ())
    }

    #[instrument(skip_all, fields(execution_id = %ctx.execution_id))]
    async fn execute(
        &self,
        spec: &Value,
        ctx: &ExecutionContext,
    ) -> Result<ExecutorResponse, ExecutorError> {
        let spec: HttpSpec = decode_spec(spec)?;
        let url = spec.check()?;

        let mut body = Map::new();
        body.insert("stage_id".into(), Value::String(ctx.stage_id.to_string()));
        body.insert("execution_id".into(), Value::String(ctx.execution_id.to_string()));
        body.extend(spec.payload.clone());

        let mut request = self.client.post(url).json(&body);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let raw = read_capped(response, MAX_RESPONSE_SIZE).await?;

        let successful = spec.response_policy.status_codes.contains(&status);
        let outputs = serde_json::from_slice::<Value>(&raw)
            .ok()
            .and_then(|mut v| v.get_mut("outputs").map(Value::take))
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();

        debug!(status, successful, "http executor answered");
        Ok(ExecutorResponse::finished(successful, outputs))
    }
}
