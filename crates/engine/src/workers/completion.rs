//! Finishing an execution: shared by the dispatcher (synchronous
//! executors, invocation failures) and the reconciler.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use bus::Message;
use db::models::{ExecutionResult, SourceType, StageExecutionRow};
use db::{FinishExecution, NewRawEvent};

use crate::context::Services;
use crate::models::{CompletionEvent, Stage};
use crate::workers::publish;
use crate::EngineError;

/// Finish a `started` execution.
///
/// The result is `passed` only if the executor reported success and every
/// required output is present. Returns `None` when another worker already
/// finished it.
pub async fn finish(
    services: &Services,
    stage: &Stage,
    execution_id: uuid::Uuid,
    successful: bool,
    reported_outputs: Map<String, Value>,
) -> Result<Option<StageExecutionRow>, EngineError> {
    // Re-read: outputs and tags may have been pushed since the claim.
    let execution = services.store.find_execution(execution_id).await?;

    let mut outputs = execution.outputs.as_object().cloned().unwrap_or_default();
    outputs.extend(reported_outputs.clone());
    let outputs = Value::Object(outputs);

    let missing = stage.missing_required_outputs(&outputs);
    if successful && !missing.is_empty() {
        warn!(execution_id = %execution.id, ?missing, "required outputs missing");
    }
    let result = if successful && missing.is_empty() {
        ExecutionResult::Passed
    } else {
        ExecutionResult::Failed
    };

    let pushed_tags = string_map(&execution.tags);
    let mut tags: BTreeMap<String, String> = services
        .store
        .list_stage_event_tags(execution.stage_event_id)
        .await?
        .into_iter()
        .map(|tag| (tag.name, tag.value))
        .collect();
    tags.extend(pushed_tags.clone());

    let finished_at = services.clock.now();
    let completion = CompletionEvent::new(
        stage,
        &execution,
        result,
        finished_at,
        outputs,
        serde_json::to_value(&tags)?,
    );

    let finished = services
        .store
        .finish_execution(FinishExecution {
            execution_id: execution.id,
            result,
            outputs: Some(Value::Object(reported_outputs)),
            finished_at,
            tags: pushed_tags,
            completion: NewRawEvent {
                source_id: stage.id,
                source_name: stage.name.clone(),
                source_type: SourceType::Stage,
                raw: serde_json::to_vec(&completion)?,
                headers: Value::Object(Map::new()),
            },
        })
        .await?;

    match &finished {
        Some(row) => {
            info!(
                canvas_id = %stage.canvas_id,
                stage_id = %stage.id,
                execution_id = %row.id,
                %result,
                "execution finished"
            );
            publish(
                services.bus.as_ref(),
                Message::ExecutionFinished {
                    canvas_id: stage.canvas_id,
                    stage_id: stage.id,
                    execution_id: row.id,
                    result: result.to_string(),
                    timestamp: finished_at,
                },
            )
            .await;
        }
        None => debug!(execution_id = %execution.id, "execution already finished"),
    }

    Ok(finished)
}

/// String-valued entries of a JSON object.
fn string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
