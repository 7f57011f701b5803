//! The `Store` trait: every read and every transactional unit of work the
//! engine's workers perform against persistent state.
//!
//! Each mutating method is atomic: either all of its writes land or none
//! do.  Claim-style methods return `None` when another worker already owns
//! (or has already moved past) the row, which is how the workers stay
//! idempotent under concurrency and at-least-once bus delivery.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    ApprovalRow, CanvasRow, EventSourceRow, ExecutionResult, ExecutionState, RawEventRow,
    RawEventState, SecretRow, SourceType, StageEventRow, StageEventState, StageEventStateReason,
    StageEventStatus, StageEventTagRow, StageExecutionRow, StageRow,
};
use crate::DbError;

// ---------------------------------------------------------------------------
// Write models
// ---------------------------------------------------------------------------

/// Position after the last row of a page: `(created_at, id)` of that row.
pub type PageCursor = (DateTime<Utc>, Uuid);

#[derive(Debug, Clone)]
pub struct NewCanvas {
    pub organization_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewEventSource {
    pub canvas_id: Uuid,
    pub name: String,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewSecret {
    pub canvas_id: Uuid,
    pub name: String,
    pub provider: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewStage {
    pub canvas_id: Uuid,
    pub name: String,
    pub conditions: Value,
    pub connections: Value,
    pub inputs: Value,
    pub input_mappings: Value,
    pub outputs: Value,
    pub secrets: Value,
    pub tags: Value,
    pub executor_spec: Value,
}

#[derive(Debug, Clone)]
pub struct NewRawEvent {
    pub source_id: Uuid,
    pub source_name: String,
    pub source_type: SourceType,
    pub raw: Vec<u8>,
    pub headers: Value,
}

/// One stage-event the router wants to materialize for a raw event.
#[derive(Debug, Clone)]
pub struct NewStageEvent {
    pub stage_id: Uuid,
    pub inputs: Value,
    pub state: StageEventState,
    pub state_reason: Option<StageEventStateReason>,
    /// Tags recorded in state `unknown`.
    pub tags: BTreeMap<String, String>,
    /// `waiting / connection` events of the same stage superseded by this
    /// one; moved to `processed / cancelled` in the same transaction.
    pub cancels: Vec<Uuid>,
}

/// What the router decided for a raw event.
#[derive(Debug, Clone)]
pub enum RoutingOutcome {
    /// No connection matched the event's source.
    Discarded,
    /// Zero or more stage-events to create; the raw event ends `processed`.
    Processed(Vec<NewStageEvent>),
}

/// Everything written when an execution finishes.
#[derive(Debug, Clone)]
pub struct FinishExecution {
    pub execution_id: Uuid,
    pub result: ExecutionResult,
    /// Outputs to merge into the execution (sync executors report them inline).
    pub outputs: Option<Value>,
    pub finished_at: DateTime<Utc>,
    /// Extra tags reported by the executor, upserted alongside the
    /// stage-event's own tags. All of them take the result's health.
    pub tags: BTreeMap<String, String>,
    /// The stage-completion raw event re-entering the router.
    pub completion: NewRawEvent,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Store: Send + Sync {
    // ------ canvases, sources, secrets, stages ------

    async fn create_canvas(&self, new: NewCanvas) -> Result<CanvasRow, DbError>;
    async fn find_canvas(&self, id: Uuid) -> Result<CanvasRow, DbError>;

    async fn create_event_source(&self, new: NewEventSource) -> Result<EventSourceRow, DbError>;
    async fn find_event_source(&self, id: Uuid) -> Result<EventSourceRow, DbError>;

    async fn create_secret(&self, new: NewSecret) -> Result<SecretRow, DbError>;
    async fn find_secret_by_name(&self, canvas_id: Uuid, name: &str) -> Result<SecretRow, DbError>;

    async fn create_stage(&self, new: NewStage) -> Result<StageRow, DbError>;
    async fn find_stage(&self, id: Uuid) -> Result<StageRow, DbError>;

    /// Stages with at least one connection whose source matches.
    async fn list_stages_connected_to(
        &self,
        source_id: Uuid,
        source_type: SourceType,
    ) -> Result<Vec<StageRow>, DbError>;

    // ------ raw events ------

    async fn create_raw_event(&self, new: NewRawEvent) -> Result<RawEventRow, DbError>;
    async fn find_raw_event(&self, id: Uuid) -> Result<RawEventRow, DbError>;

    /// Oldest first.
    async fn list_raw_events(
        &self,
        state: RawEventState,
        limit: i64,
    ) -> Result<Vec<RawEventRow>, DbError>;

    async fn latest_raw_event_for_source(
        &self,
        source_id: Uuid,
        source_type: SourceType,
    ) -> Result<Option<RawEventRow>, DbError>;

    /// Apply the router's decision for a raw event that is still `pending`.
    ///
    /// Returns `None` without writing anything if the event is locked by
    /// another router or no longer pending.
    async fn commit_routing(
        &self,
        raw_event_id: Uuid,
        outcome: RoutingOutcome,
    ) -> Result<Option<Vec<StageEventRow>>, DbError>;

    // ------ stage events ------

    async fn find_stage_event(&self, id: Uuid) -> Result<StageEventRow, DbError>;

    /// All stage-events of a stage, oldest first.
    async fn list_stage_events_for_stage(&self, stage_id: Uuid)
        -> Result<Vec<StageEventRow>, DbError>;

    /// Stage-events in the given position, across stages when `stage_id`
    /// is `None`. Ordered by `(created_at, id)`, starting after `after`.
    async fn list_stage_events(
        &self,
        stage_id: Option<Uuid>,
        status: StageEventStatus,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<StageEventRow>, DbError>;

    /// Ids of stages that have at least one `pending` stage-event.
    async fn stages_with_pending_events(&self) -> Result<Vec<Uuid>, DbError>;

    async fn oldest_pending_stage_event(
        &self,
        stage_id: Uuid,
    ) -> Result<Option<StageEventRow>, DbError>;

    /// Compare-and-set on the stage-event state. Returns `false` when the
    /// event was not in `from`.
    async fn transition_stage_event(
        &self,
        id: Uuid,
        from: StageEventStatus,
        to: StageEventStatus,
    ) -> Result<bool, DbError>;

    async fn list_stage_event_tags(
        &self,
        stage_event_id: Uuid,
    ) -> Result<Vec<StageEventTagRow>, DbError>;

    // ------ approvals ------

    /// Fails with [`DbError::AlreadyApproved`] for a repeated requester.
    async fn create_approval(
        &self,
        stage_event_id: Uuid,
        requester_id: Uuid,
    ) -> Result<ApprovalRow, DbError>;

    async fn count_approvals(&self, stage_event_id: Uuid) -> Result<i64, DbError>;

    // ------ executions ------

    /// Create the `pending` execution for a `pending` stage-event and move
    /// the event to `waiting / execution`.
    ///
    /// Returns `None` if the event is locked, no longer pending, or its
    /// stage already has a `pending`/`started` execution.
    async fn create_execution(
        &self,
        stage_event_id: Uuid,
    ) -> Result<Option<StageExecutionRow>, DbError>;

    async fn find_execution(&self, id: Uuid) -> Result<StageExecutionRow, DbError>;

    /// Ordered by `(created_at, id)`, starting after `after`.
    async fn list_executions(
        &self,
        state: ExecutionState,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<StageExecutionRow>, DbError>;

    async fn list_executions_for_stage(
        &self,
        stage_id: Uuid,
    ) -> Result<Vec<StageExecutionRow>, DbError>;

    /// Claim a `pending` execution by moving it to `started`.
    async fn start_execution(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Option<StageExecutionRow>, DbError>;

    async fn set_execution_reference(&self, id: Uuid, reference_id: &str)
        -> Result<(), DbError>;

    /// Shallow-merge a JSON object into the execution's outputs.
    /// Fails with [`DbError::ExecutionFinished`] once the execution finished.
    async fn merge_execution_outputs(
        &self,
        id: Uuid,
        outputs: Value,
    ) -> Result<StageExecutionRow, DbError>;

    /// Shallow-merge a JSON object into the execution's tags. Same
    /// finished-execution rule as outputs.
    async fn merge_execution_tags(
        &self,
        id: Uuid,
        tags: Value,
    ) -> Result<StageExecutionRow, DbError>;

    /// Finish a `started` execution: record the result, move its
    /// stage-event to `processed`, flip tags, insert the completion event.
    ///
    /// Returns `None` if the execution is not `started` anymore.
    async fn finish_execution(
        &self,
        finish: FinishExecution,
    ) -> Result<Option<StageExecutionRow>, DbError>;

    /// Most recent finished execution of a stage whose result is one of
    /// `results`.
    async fn last_finished_execution(
        &self,
        stage_id: Uuid,
        results: &[ExecutionResult],
    ) -> Result<Option<StageExecutionRow>, DbError>;
}
