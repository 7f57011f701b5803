//! Repository functions: one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! Plain SQL without business logic.  [`PgStore`] stitches
//! them together behind the [`Store`](crate::Store) trait.
//!
//! Queries are checked at runtime (`sqlx::query_as::<_, T>`), so building
//! the workspace never needs a live database.

pub mod canvases;
pub mod events;
pub mod executions;
pub mod stage_events;
pub mod stages;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::models::{
    ApprovalRow, CanvasRow, EventSourceRow, ExecutionResult, ExecutionState, RawEventRow,
    RawEventState, SecretRow, SourceType, StageEventRow, StageEventStatus, StageEventTagRow,
    StageExecutionRow, StageRow,
};
use crate::store::{
    FinishExecution, NewCanvas, NewEventSource, NewRawEvent, NewSecret, NewStage, PageCursor,
    RoutingOutcome, Store,
};
use crate::{DbError, DbPool};

// ---------------------------------------------------------------------------
// Column decoding helpers
// ---------------------------------------------------------------------------

/// Decode a text column into one of the state enums.
pub(crate) fn text_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.into(),
    })
}

pub(crate) fn optional_text_column<T>(row: &PgRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: FromStr<Err = String>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: e.into(),
        })
    })
    .transpose()
}

/// Map a unique-constraint violation onto [`DbError::Duplicate`].
pub(crate) fn duplicate_as(what: &str) -> impl FnOnce(sqlx::Error) -> DbError + '_ {
    move |err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(what.to_string()),
        _ => DbError::Sqlx(err),
    }
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// [`Store`] backed by Postgres. Claims use `FOR UPDATE SKIP LOCKED`, so any
/// number of engine replicas can share one database.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_canvas(&self, new: NewCanvas) -> Result<CanvasRow, DbError> {
        canvases::create_canvas(&self.pool, new).await
    }

    async fn find_canvas(&self, id: Uuid) -> Result<CanvasRow, DbError> {
        canvases::find_canvas(&self.pool, id).await
    }

    async fn create_event_source(&self, new: NewEventSource) -> Result<EventSourceRow, DbError> {
        canvases::create_event_source(&self.pool, new).await
    }

    async fn find_event_source(&self, id: Uuid) -> Result<EventSourceRow, DbError> {
        canvases::find_event_source(&self.pool, id).await
    }

    async fn create_secret(&self, new: NewSecret) -> Result<SecretRow, DbError> {
        canvases::create_secret(&self.pool, new).await
    }

    async fn find_secret_by_name(&self, canvas_id: Uuid, name: &str) -> Result<SecretRow, DbError> {
        canvases::find_secret_by_name(&self.pool, canvas_id, name).await
    }

    async fn create_stage(&self, new: NewStage) -> Result<StageRow, DbError> {
        stages::create_stage(&self.pool, new).await
    }

    async fn find_stage(&self, id: Uuid) -> Result<StageRow, DbError> {
        stages::find_stage(&self.pool, id).await
    }

    async fn list_stages_connected_to(
        &self,
        source_id: Uuid,
        source_type: SourceType,
    ) -> Result<Vec<StageRow>, DbError> {
        stages::list_stages_connected_to(&self.pool, source_id, source_type).await
    }

    async fn create_raw_event(&self, new: NewRawEvent) -> Result<RawEventRow, DbError> {
        events::create_raw_event(&self.pool, new).await
    }

    async fn find_raw_event(&self, id: Uuid) -> Result<RawEventRow, DbError> {
        events::find_raw_event(&self.pool, id).await
    }

    async fn list_raw_events(
        &self,
        state: RawEventState,
        limit: i64,
    ) -> Result<Vec<RawEventRow>, DbError> {
        events::list_raw_events(&self.pool, state, limit).await
    }

    async fn latest_raw_event_for_source(
        &self,
        source_id: Uuid,
        source_type: SourceType,
    ) -> Result<Option<RawEventRow>, DbError> {
        events::latest_raw_event_for_source(&self.pool, source_id, source_type).await
    }

    async fn commit_routing(
        &self,
        raw_event_id: Uuid,
        outcome: RoutingOutcome,
    ) -> Result<Option<Vec<StageEventRow>>, DbError> {
        events::commit_routing(&self.pool, raw_event_id, outcome).await
    }

    async fn find_stage_event(&self, id: Uuid) -> Result<StageEventRow, DbError> {
        stage_events::find_stage_event(&self.pool, id).await
    }

    async fn list_stage_events_for_stage(
        &self,
        stage_id: Uuid,
    ) -> Result<Vec<StageEventRow>, DbError> {
        stage_events::list_stage_events_for_stage(&self.pool, stage_id).await
    }

    async fn list_stage_events(
        &self,
        stage_id: Option<Uuid>,
        status: StageEventStatus,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<StageEventRow>, DbError> {
        stage_events::list_stage_events(&self.pool, stage_id, status, after, limit).await
    }

    async fn stages_with_pending_events(&self) -> Result<Vec<Uuid>, DbError> {
        stage_events::stages_with_pending_events(&self.pool).await
    }

    async fn oldest_pending_stage_event(
        &self,
        stage_id: Uuid,
    ) -> Result<Option<StageEventRow>, DbError> {
        stage_events::oldest_pending_stage_event(&self.pool, stage_id).await
    }

    async fn transition_stage_event(
        &self,
        id: Uuid,
        from: StageEventStatus,
        to: StageEventStatus,
    ) -> Result<bool, DbError> {
        stage_events::transition_stage_event(&self.pool, id, from, to).await
    }

    async fn list_stage_event_tags(
        &self,
        stage_event_id: Uuid,
    ) -> Result<Vec<StageEventTagRow>, DbError> {
        stage_events::list_stage_event_tags(&self.pool, stage_event_id).await
    }

    async fn create_approval(
        &self,
        stage_event_id: Uuid,
        requester_id: Uuid,
    ) -> Result<ApprovalRow, DbError> {
        stage_events::create_approval(&self.pool, stage_event_id, requester_id).await
    }

    async fn count_approvals(&self, stage_event_id: Uuid) -> Result<i64, DbError> {
        stage_events::count_approvals(&self.pool, stage_event_id).await
    }

    async fn create_execution(
        &self,
        stage_event_id: Uuid,
    ) -> Result<Option<StageExecutionRow>, DbError> {
        executions::create_execution(&self.pool, stage_event_id).await
    }

    async fn find_execution(&self, id: Uuid) -> Result<StageExecutionRow, DbError> {
        executions::find_execution(&self.pool, id).await
    }

    async fn list_executions(
        &self,
        state: ExecutionState,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<StageExecutionRow>, DbError> {
        executions::list_executions(&self.pool, state, after, limit).await
    }

    async fn list_executions_for_stage(
        &self,
        stage_id: Uuid,
    ) -> Result<Vec<StageExecutionRow>, DbError> {
        executions::list_executions_for_stage(&self.pool, stage_id).await
    }

    async fn start_execution(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Option<StageExecutionRow>, DbError> {
        executions::start_execution(&self.pool, id, started_at).await
    }

    async fn set_execution_reference(
        &self,
        id: Uuid,
        reference_id: &str,
    ) -> Result<(), DbError> {
        executions::set_execution_reference(&self.pool, id, reference_id).await
    }

    async fn merge_execution_outputs(
        &self,
        id: Uuid,
        outputs: Value,
    ) -> Result<StageExecutionRow, DbError> {
        executions::merge_execution_column(&self.pool, id, "outputs", outputs).await
    }

    async fn merge_execution_tags(
        &self,
        id: Uuid,
        tags: Value,
    ) -> Result<StageExecutionRow, DbError> {
        executions::merge_execution_column(&self.pool, id, "tags", tags).await
    }

    async fn finish_execution(
        &self,
        finish: FinishExecution,
    ) -> Result<Option<StageExecutionRow>, DbError> {
        executions::finish_execution(&self.pool, finish).await
    }

    async fn last_finished_execution(
        &self,
        stage_id: Uuid,
        results: &[ExecutionResult],
    ) -> Result<Option<StageExecutionRow>, DbError> {
        executions::last_finished_execution(&self.pool, stage_id, results).await
    }
}
