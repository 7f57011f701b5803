//! Endpoints external jobs use to report back on their execution. Callers
//! authenticate with the token handed to them at dispatch.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use db::models::{ExecutionState, StageExecutionRow};
use db::DbError;
use engine::Stage;

use super::{header_str, read_capped};
use crate::{ApiError, AppState};

/// Outputs and tags pushed by an execution can be up to 4 KiB.
pub const MAX_PUSH_SIZE: usize = 4 * 1024;

#[derive(Debug, Deserialize)]
struct OutputsRequest {
    outputs: Map<String, Value>,
}

#[instrument(skip_all, fields(execution_id = %execution_id))]
pub async fn push_outputs(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers)?;
    let body = read_capped(&headers, body, MAX_PUSH_SIZE).await?;
    let request: OutputsRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;

    let execution = authorized_execution(&state, &execution_id, token).await?;
    let stage = Stage::try_from(&state.store.find_stage(execution.stage_id).await?)?;

    // Outputs the stage does not declare are dropped.
    let outputs = stage.declared_outputs(&request.outputs);
    if outputs.len() < request.outputs.len() {
        debug!(dropped = request.outputs.len() - outputs.len(), "ignoring undeclared outputs");
    }
    state.store.merge_execution_outputs(execution.id, Value::Object(outputs)).await?;

    info!("execution outputs updated");
    Ok(StatusCode::OK)
}

#[instrument(skip_all, fields(execution_id = %execution_id))]
pub async fn push_tags(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers)?;
    let body = read_capped(&headers, body, MAX_PUSH_SIZE).await?;
    let tags: Map<String, Value> = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("tags must be a JSON object".into()))?;
    if let Some((name, _)) = tags.iter().find(|(_, value)| !value.is_string()) {
        return Err(ApiError::BadRequest(format!("tag '{name}' must be a string")));
    }

    let execution = authorized_execution(&state, &execution_id, token).await?;
    state.store.merge_execution_tags(execution.id, Value::Object(tags)).await?;

    info!("execution tags updated");
    Ok(StatusCode::OK)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = header_str(headers, header::AUTHORIZATION.as_str())
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".into()))?;
    value
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("malformed Authorization header".into()))
}

/// The execution the token was issued for, as long as it still takes
/// pushes. The store re-checks the state when merging.
async fn authorized_execution(
    state: &AppState,
    execution_id: &str,
    token: &str,
) -> Result<StageExecutionRow, ApiError> {
    let execution_id = Uuid::parse_str(execution_id).map_err(|_| ApiError::NotFound("execution"))?;
    if !state.signer.authorizes(token, execution_id) {
        return Err(ApiError::Unauthorized("invalid token".into()));
    }
    let execution = match state.store.find_execution(execution_id).await {
        Ok(execution) => execution,
        Err(DbError::NotFound) => return Err(ApiError::NotFound("execution")),
        Err(err) => return Err(err.into()),
    };
    if execution.state == ExecutionState::Finished {
        return Err(ApiError::Conflict("execution already finished".into()));
    }
    Ok(execution)
}
