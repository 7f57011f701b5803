//! Stage-execution repository functions.
//!
//! Creation enforces "at most one pending/started execution per stage"
//! twice: the gate evaluator's transaction checks it, and the partial
//! unique index `stage_executions_active_idx` backs it up across replicas.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::{events, optional_text_column, stage_events, text_column};
use crate::models::{ExecutionResult, ExecutionState, StageEventRow, StageExecutionRow, TagState};
use crate::store::{FinishExecution, PageCursor};
use crate::DbError;

impl<'r> FromRow<'r, PgRow> for StageExecutionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            stage_id: row.try_get("stage_id")?,
            stage_event_id: row.try_get("stage_event_id")?,
            state: text_column(row, "state")?,
            result: optional_text_column(row, "result")?,
            reference_id: row.try_get("reference_id")?,
            outputs: row.try_get("outputs")?,
            tags: row.try_get("tags")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

/// Create the `pending` execution for a `pending` stage-event.
pub async fn create_execution(
    pool: &PgPool,
    stage_event_id: Uuid,
) -> Result<Option<StageExecutionRow>, DbError> {
    let mut tx = pool.begin().await?;

    let event = sqlx::query_as::<_, StageEventRow>(
        r#"
        SELECT * FROM stage_events
        WHERE id = $1 AND state = 'pending'
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(stage_event_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(event) = event else {
        tx.rollback().await?;
        return Ok(None);
    };

    let busy = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM stage_executions
            WHERE stage_id = $1 AND state IN ('pending', 'started')
        )
        "#,
    )
    .bind(event.stage_id)
    .fetch_one(&mut *tx)
    .await?;

    if busy {
        debug!(stage_id = %event.stage_id, "stage already has an active execution");
        tx.rollback().await?;
        return Ok(None);
    }

    let execution = sqlx::query_as::<_, StageExecutionRow>(
        r#"
        INSERT INTO stage_executions
            (id, stage_id, stage_event_id, state, outputs, tags, created_at)
        VALUES ($1, $2, $3, 'pending', '{}', '{}', $4)
        ON CONFLICT DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(event.stage_id)
    .bind(event.id)
    .bind(Utc::now())
    .fetch_optional(&mut *tx)
    .await?;

    let Some(execution) = execution else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query(
        "UPDATE stage_events SET state = 'waiting', state_reason = 'execution' WHERE id = $1",
    )
    .bind(event.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(execution))
}

pub async fn find_execution(pool: &PgPool, id: Uuid) -> Result<StageExecutionRow, DbError> {
    sqlx::query_as::<_, StageExecutionRow>("SELECT * FROM stage_executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn list_executions(
    pool: &PgPool,
    state: ExecutionState,
    after: Option<PageCursor>,
    limit: i64,
) -> Result<Vec<StageExecutionRow>, DbError> {
    let rows = sqlx::query_as::<_, StageExecutionRow>(
        r#"
        SELECT * FROM stage_executions
        WHERE state = $1
          AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3))
        ORDER BY created_at ASC, id ASC
        LIMIT $4
        "#,
    )
    .bind(state.as_str())
    .bind(after.map(|(created_at, _)| created_at))
    .bind(after.map(|(_, id)| id))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_executions_for_stage(
    pool: &PgPool,
    stage_id: Uuid,
) -> Result<Vec<StageExecutionRow>, DbError> {
    let rows = sqlx::query_as::<_, StageExecutionRow>(
        "SELECT * FROM stage_executions WHERE stage_id = $1 ORDER BY created_at ASC",
    )
    .bind(stage_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Claim a `pending` execution, skipping it if another dispatcher holds it.
pub async fn start_execution(
    pool: &PgPool,
    id: Uuid,
    started_at: DateTime<Utc>,
) -> Result<Option<StageExecutionRow>, DbError> {
    let row = sqlx::query_as::<_, StageExecutionRow>(
        r#"
        UPDATE stage_executions
        SET state = 'started', started_at = $2
        WHERE id = (
            SELECT id FROM stage_executions
            WHERE id = $1 AND state = 'pending'
            FOR UPDATE SKIP LOCKED
        )
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(started_at)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn set_execution_reference(
    pool: &PgPool,
    id: Uuid,
    reference_id: &str,
) -> Result<(), DbError> {
    sqlx::query("UPDATE stage_executions SET reference_id = $1 WHERE id = $2")
        .bind(reference_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Shallow-merge `patch` into the `outputs` or `tags` column.
pub async fn merge_execution_column(
    pool: &PgPool,
    id: Uuid,
    column: &'static str,
    patch: Value,
) -> Result<StageExecutionRow, DbError> {
    let sql = match column {
        "outputs" => {
            "UPDATE stage_executions SET outputs = outputs || $1 \
             WHERE id = $2 AND state <> 'finished' RETURNING *"
        }
        "tags" => {
            "UPDATE stage_executions SET tags = tags || $1 \
             WHERE id = $2 AND state <> 'finished' RETURNING *"
        }
        other => return Err(DbError::InvalidColumn(other.to_string())),
    };

    let updated = sqlx::query_as::<_, StageExecutionRow>(sql)
        .bind(patch)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    if let Some(row) = updated {
        return Ok(row);
    }

    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM stage_executions WHERE id = $1)",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;
    Err(if exists { DbError::ExecutionFinished } else { DbError::NotFound })
}

pub async fn finish_execution(
    pool: &PgPool,
    finish: FinishExecution,
) -> Result<Option<StageExecutionRow>, DbError> {
    let mut tx = pool.begin().await?;

    let outputs = finish.outputs.unwrap_or_else(|| Value::Object(Default::default()));
    let execution = sqlx::query_as::<_, StageExecutionRow>(
        r#"
        UPDATE stage_executions
        SET state = 'finished', result = $2, finished_at = $3, outputs = outputs || $4
        WHERE id = $1 AND state = 'started'
        RETURNING *
        "#,
    )
    .bind(finish.execution_id)
    .bind(finish.result.as_str())
    .bind(finish.finished_at)
    .bind(outputs)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(execution) = execution else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query(
        "UPDATE stage_events SET state = 'processed', state_reason = NULL WHERE id = $1",
    )
    .bind(execution.stage_event_id)
    .execute(&mut *tx)
    .await?;

    stage_events::flip_tags(
        &mut *tx,
        execution.stage_event_id,
        &finish.tags,
        TagState::from(finish.result),
    )
    .await?;

    events::insert_raw_event(&mut *tx, finish.completion).await?;

    tx.commit().await?;
    Ok(Some(execution))
}

pub async fn last_finished_execution(
    pool: &PgPool,
    stage_id: Uuid,
    results: &[ExecutionResult],
) -> Result<Option<StageExecutionRow>, DbError> {
    let results: Vec<&str> = results.iter().map(|r| r.as_str()).collect();
    let row = sqlx::query_as::<_, StageExecutionRow>(
        r#"
        SELECT * FROM stage_executions
        WHERE stage_id = $1 AND state = 'finished' AND result = ANY($2)
        ORDER BY finished_at DESC
        LIMIT 1
        "#,
    )
    .bind(stage_id)
    .bind(results)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
