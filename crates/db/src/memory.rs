//! In-process [`Store`] with the same semantics as [`PgStore`](crate::PgStore).
//!
//! Every method runs under a single mutex, so each call is trivially atomic
//! and the claim methods behave like their `SKIP LOCKED` counterparts.
//! Used by the test suites and by `--store memory` for local runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{
    ApprovalRow, CanvasRow, EventSourceRow, ExecutionResult, ExecutionState, RawEventRow,
    RawEventState, SecretRow, SourceType, StageEventRow, StageEventState, StageEventStateReason,
    StageEventStatus, StageEventTagRow, StageExecutionRow, StageRow, TagState,
};
use crate::store::{
    FinishExecution, NewCanvas, NewEventSource, NewRawEvent, NewSecret, NewStage, PageCursor,
    RoutingOutcome, Store,
};
use crate::DbError;

#[derive(Default)]
struct Tables {
    canvases: Vec<CanvasRow>,
    sources: Vec<EventSourceRow>,
    secrets: Vec<SecretRow>,
    stages: Vec<StageRow>,
    raw_events: Vec<RawEventRow>,
    stage_events: Vec<StageEventRow>,
    tags: Vec<StageEventTagRow>,
    approvals: Vec<ApprovalRow>,
    executions: Vec<StageExecutionRow>,
}

/// A `Store` that keeps every table in memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shallow-merge the keys of `patch` into `target`, replacing non-objects.
fn merge_object(target: &mut Value, patch: Value) {
    match (target.as_object_mut(), patch) {
        (Some(existing), Value::Object(incoming)) => existing.extend(incoming),
        (None, Value::Object(incoming)) => *target = Value::Object(incoming),
        _ => {}
    }
}

fn insert_raw_event(tables: &mut Tables, new: NewRawEvent) -> RawEventRow {
    // Keep received_at strictly increasing so "latest" and "oldest first"
    // stay deterministic even when events land within the same tick.
    let mut received_at = Utc::now();
    if let Some(last) = tables.raw_events.last() {
        if received_at <= last.received_at {
            received_at = last.received_at + chrono::Duration::microseconds(1);
        }
    }

    let row = RawEventRow {
        id: Uuid::new_v4(),
        source_id: new.source_id,
        source_name: new.source_name,
        source_type: new.source_type,
        raw: new.raw,
        headers: new.headers,
        state: RawEventState::Pending,
        received_at,
    };
    tables.raw_events.push(row.clone());
    row
}

fn next_created_at<'a>(existing: impl Iterator<Item = &'a DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match existing.max() {
        Some(last) if *last >= now => *last + chrono::Duration::microseconds(1),
        _ => now,
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ------------------------------------------------------------------
    // canvases, sources, secrets, stages
    // ------------------------------------------------------------------

    async fn create_canvas(&self, new: NewCanvas) -> Result<CanvasRow, DbError> {
        let mut tables = self.tables.lock();
        if tables
            .canvases
            .iter()
            .any(|c| c.organization_id == new.organization_id && c.name == new.name)
        {
            return Err(DbError::Duplicate("canvas".into()));
        }
        let row = CanvasRow {
            id: Uuid::new_v4(),
            organization_id: new.organization_id,
            name: new.name,
            created_at: Utc::now(),
        };
        tables.canvases.push(row.clone());
        Ok(row)
    }

    async fn find_canvas(&self, id: Uuid) -> Result<CanvasRow, DbError> {
        let tables = self.tables.lock();
        tables.canvases.iter().find(|c| c.id == id).cloned().ok_or(DbError::NotFound)
    }

    async fn create_event_source(&self, new: NewEventSource) -> Result<EventSourceRow, DbError> {
        let mut tables = self.tables.lock();
        if tables.sources.iter().any(|s| s.canvas_id == new.canvas_id && s.name == new.name) {
            return Err(DbError::Duplicate("event source".into()));
        }
        let row = EventSourceRow {
            id: Uuid::new_v4(),
            canvas_id: new.canvas_id,
            name: new.name,
            key: new.key,
            created_at: Utc::now(),
        };
        tables.sources.push(row.clone());
        Ok(row)
    }

    async fn find_event_source(&self, id: Uuid) -> Result<EventSourceRow, DbError> {
        let tables = self.tables.lock();
        tables.sources.iter().find(|s| s.id == id).cloned().ok_or(DbError::NotFound)
    }

    async fn create_secret(&self, new: NewSecret) -> Result<SecretRow, DbError> {
        let mut tables = self.tables.lock();
        if tables.secrets.iter().any(|s| s.canvas_id == new.canvas_id && s.name == new.name) {
            return Err(DbError::Duplicate("secret".into()));
        }
        let row = SecretRow {
            id: Uuid::new_v4(),
            canvas_id: new.canvas_id,
            name: new.name,
            provider: new.provider,
            data: new.data,
            created_at: Utc::now(),
        };
        tables.secrets.push(row.clone());
        Ok(row)
    }

    async fn find_secret_by_name(&self, canvas_id: Uuid, name: &str) -> Result<SecretRow, DbError> {
        let tables = self.tables.lock();
        tables
            .secrets
            .iter()
            .find(|s| s.canvas_id == canvas_id && s.name == name)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn create_stage(&self, new: NewStage) -> Result<StageRow, DbError> {
        let mut tables = self.tables.lock();
        if tables.stages.iter().any(|s| s.canvas_id == new.canvas_id && s.name == new.name) {
            return Err(DbError::Duplicate("stage".into()));
        }
        let row = StageRow {
            id: Uuid::new_v4(),
            canvas_id: new.canvas_id,
            name: new.name,
            conditions: new.conditions,
            connections: new.connections,
            inputs: new.inputs,
            input_mappings: new.input_mappings,
            outputs: new.outputs,
            secrets: new.secrets,
            tags: new.tags,
            executor_spec: new.executor_spec,
            created_at: next_created_at(tables.stages.iter().map(|s| &s.created_at)),
        };
        tables.stages.push(row.clone());
        Ok(row)
    }

    async fn find_stage(&self, id: Uuid) -> Result<StageRow, DbError> {
        let tables = self.tables.lock();
        tables.stages.iter().find(|s| s.id == id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_stages_connected_to(
        &self,
        source_id: Uuid,
        source_type: SourceType,
    ) -> Result<Vec<StageRow>, DbError> {
        let tables = self.tables.lock();
        Ok(tables
            .stages
            .iter()
            .filter(|s| s.is_connected_to(source_id, source_type))
            .cloned()
            .collect())
    }

    // ------------------------------------------------------------------
    // raw events
    // ------------------------------------------------------------------

    async fn create_raw_event(&self, new: NewRawEvent) -> Result<RawEventRow, DbError> {
        let mut tables = self.tables.lock();
        Ok(insert_raw_event(&mut tables, new))
    }

    async fn find_raw_event(&self, id: Uuid) -> Result<RawEventRow, DbError> {
        let tables = self.tables.lock();
        tables.raw_events.iter().find(|e| e.id == id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_raw_events(
        &self,
        state: RawEventState,
        limit: i64,
    ) -> Result<Vec<RawEventRow>, DbError> {
        let tables = self.tables.lock();
        Ok(tables
            .raw_events
            .iter()
            .filter(|e| e.state == state)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn latest_raw_event_for_source(
        &self,
        source_id: Uuid,
        source_type: SourceType,
    ) -> Result<Option<RawEventRow>, DbError> {
        let tables = self.tables.lock();
        Ok(tables
            .raw_events
            .iter()
            .rev()
            .find(|e| e.source_id == source_id && e.source_type == source_type)
            .cloned())
    }

    async fn commit_routing(
        &self,
        raw_event_id: Uuid,
        outcome: RoutingOutcome,
    ) -> Result<Option<Vec<StageEventRow>>, DbError> {
        let mut tables = self.tables.lock();
        let Some(raw_event) = tables
            .raw_events
            .iter()
            .find(|e| e.id == raw_event_id && e.state == RawEventState::Pending)
            .cloned()
        else {
            return Ok(None);
        };

        let (final_state, plans) = match outcome {
            RoutingOutcome::Discarded => (RawEventState::Discarded, Vec::new()),
            RoutingOutcome::Processed(plans) => (RawEventState::Processed, plans),
        };

        let mut created = Vec::with_capacity(plans.len());
        for plan in plans {
            for event in tables.stage_events.iter_mut() {
                if plan.cancels.contains(&event.id)
                    && event.stage_id == plan.stage_id
                    && event.status()
                        == (StageEventState::Waiting, Some(StageEventStateReason::Connection))
                {
                    event.state = StageEventState::Processed;
                    event.state_reason = Some(StageEventStateReason::Cancelled);
                }
            }

            let row = StageEventRow {
                id: Uuid::new_v4(),
                stage_id: plan.stage_id,
                source_id: raw_event.source_id,
                source_name: raw_event.source_name.clone(),
                source_type: raw_event.source_type,
                raw_event_id: raw_event.id,
                inputs: plan.inputs,
                state: plan.state,
                state_reason: plan.state_reason,
                created_at: next_created_at(tables.stage_events.iter().map(|e| &e.created_at)),
            };
            for (name, value) in plan.tags {
                tables.tags.push(StageEventTagRow {
                    stage_event_id: row.id,
                    name,
                    value,
                    state: TagState::Unknown,
                });
            }
            tables.stage_events.push(row.clone());
            created.push(row);
        }

        if let Some(event) = tables.raw_events.iter_mut().find(|e| e.id == raw_event_id) {
            event.state = final_state;
        }
        Ok(Some(created))
    }

    // ------------------------------------------------------------------
    // stage events
    // ------------------------------------------------------------------

    async fn find_stage_event(&self, id: Uuid) -> Result<StageEventRow, DbError> {
        let tables = self.tables.lock();
        tables.stage_events.iter().find(|e| e.id == id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_stage_events_for_stage(
        &self,
        stage_id: Uuid,
    ) -> Result<Vec<StageEventRow>, DbError> {
        let tables = self.tables.lock();
        Ok(tables.stage_events.iter().filter(|e| e.stage_id == stage_id).cloned().collect())
    }

    async fn list_stage_events(
        &self,
        stage_id: Option<Uuid>,
        status: StageEventStatus,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<StageEventRow>, DbError> {
        let tables = self.tables.lock();
        Ok(tables
            .stage_events
            .iter()
            .filter(|e| e.status() == status && stage_id.map_or(true, |id| e.stage_id == id))
            .filter(|e| after.map_or(true, |cursor| (e.created_at, e.id) > cursor))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn stages_with_pending_events(&self) -> Result<Vec<Uuid>, DbError> {
        let tables = self.tables.lock();
        let mut ids: Vec<Uuid> = Vec::new();
        for event in tables.stage_events.iter().filter(|e| e.state == StageEventState::Pending) {
            if !ids.contains(&event.stage_id) {
                ids.push(event.stage_id);
            }
        }
        Ok(ids)
    }

    async fn oldest_pending_stage_event(
        &self,
        stage_id: Uuid,
    ) -> Result<Option<StageEventRow>, DbError> {
        let tables = self.tables.lock();
        Ok(tables
            .stage_events
            .iter()
            .find(|e| e.stage_id == stage_id && e.state == StageEventState::Pending)
            .cloned())
    }

    async fn transition_stage_event(
        &self,
        id: Uuid,
        from: StageEventStatus,
        to: StageEventStatus,
    ) -> Result<bool, DbError> {
        let mut tables = self.tables.lock();
        match tables.stage_events.iter_mut().find(|e| e.id == id && e.status() == from) {
            Some(event) => {
                (event.state, event.state_reason) = to;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_stage_event_tags(
        &self,
        stage_event_id: Uuid,
    ) -> Result<Vec<StageEventTagRow>, DbError> {
        let tables = self.tables.lock();
        let mut tags: Vec<StageEventTagRow> = tables
            .tags
            .iter()
            .filter(|t| t.stage_event_id == stage_event_id)
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    // ------------------------------------------------------------------
    // approvals
    // ------------------------------------------------------------------

    async fn create_approval(
        &self,
        stage_event_id: Uuid,
        requester_id: Uuid,
    ) -> Result<ApprovalRow, DbError> {
        let mut tables = self.tables.lock();
        if !tables.stage_events.iter().any(|e| e.id == stage_event_id) {
            return Err(DbError::NotFound);
        }
        if tables
            .approvals
            .iter()
            .any(|a| a.stage_event_id == stage_event_id && a.requester_id == requester_id)
        {
            return Err(DbError::AlreadyApproved);
        }
        let row = ApprovalRow {
            id: Uuid::new_v4(),
            stage_event_id,
            requester_id,
            approved_at: Utc::now(),
        };
        tables.approvals.push(row.clone());
        Ok(row)
    }

    async fn count_approvals(&self, stage_event_id: Uuid) -> Result<i64, DbError> {
        let tables = self.tables.lock();
        let count = tables.approvals.iter().filter(|a| a.stage_event_id == stage_event_id).count();
        Ok(count as i64)
    }

    // ------------------------------------------------------------------
    // executions
    // ------------------------------------------------------------------

    async fn create_execution(
        &self,
        stage_event_id: Uuid,
    ) -> Result<Option<StageExecutionRow>, DbError> {
        let mut tables = self.tables.lock();
        let Some(event) = tables
            .stage_events
            .iter()
            .find(|e| e.id == stage_event_id && e.state == StageEventState::Pending)
            .cloned()
        else {
            return Ok(None);
        };

        let busy = tables.executions.iter().any(|x| {
            x.stage_id == event.stage_id
                && matches!(x.state, ExecutionState::Pending | ExecutionState::Started)
        });
        let already = tables.executions.iter().any(|x| x.stage_event_id == event.id);
        if busy || already {
            return Ok(None);
        }

        let execution = StageExecutionRow {
            id: Uuid::new_v4(),
            stage_id: event.stage_id,
            stage_event_id: event.id,
            state: ExecutionState::Pending,
            result: None,
            reference_id: None,
            outputs: Value::Object(Map::new()),
            tags: Value::Object(Map::new()),
            created_at: next_created_at(tables.executions.iter().map(|x| &x.created_at)),
            started_at: None,
            finished_at: None,
        };
        tables.executions.push(execution.clone());

        if let Some(event) = tables.stage_events.iter_mut().find(|e| e.id == stage_event_id) {
            event.state = StageEventState::Waiting;
            event.state_reason = Some(StageEventStateReason::Execution);
        }
        Ok(Some(execution))
    }

    async fn find_execution(&self, id: Uuid) -> Result<StageExecutionRow, DbError> {
        let tables = self.tables.lock();
        tables.executions.iter().find(|x| x.id == id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_executions(
        &self,
        state: ExecutionState,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<StageExecutionRow>, DbError> {
        let tables = self.tables.lock();
        Ok(tables
            .executions
            .iter()
            .filter(|x| x.state == state)
            .filter(|x| after.map_or(true, |cursor| (x.created_at, x.id) > cursor))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn list_executions_for_stage(
        &self,
        stage_id: Uuid,
    ) -> Result<Vec<StageExecutionRow>, DbError> {
        let tables = self.tables.lock();
        Ok(tables.executions.iter().filter(|x| x.stage_id == stage_id).cloned().collect())
    }

    async fn start_execution(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Option<StageExecutionRow>, DbError> {
        let mut tables = self.tables.lock();
        match tables
            .executions
            .iter_mut()
            .find(|x| x.id == id && x.state == ExecutionState::Pending)
        {
            Some(execution) => {
                execution.state = ExecutionState::Started;
                execution.started_at = Some(started_at);
                Ok(Some(execution.clone()))
            }
            None => Ok(None),
        }
    }

    async fn set_execution_reference(
        &self,
        id: Uuid,
        reference_id: &str,
    ) -> Result<(), DbError> {
        let mut tables = self.tables.lock();
        let execution =
            tables.executions.iter_mut().find(|x| x.id == id).ok_or(DbError::NotFound)?;
        execution.reference_id = Some(reference_id.to_string());
        Ok(())
    }

    async fn merge_execution_outputs(
        &self,
        id: Uuid,
        outputs: Value,
    ) -> Result<StageExecutionRow, DbError> {
        let mut tables = self.tables.lock();
        let execution =
            tables.executions.iter_mut().find(|x| x.id == id).ok_or(DbError::NotFound)?;
        if execution.state == ExecutionState::Finished {
            return Err(DbError::ExecutionFinished);
        }
        merge_object(&mut execution.outputs, outputs);
        Ok(execution.clone())
    }

    async fn merge_execution_tags(
        &self,
        id: Uuid,
        tags: Value,
    ) -> Result<StageExecutionRow, DbError> {
        let mut tables = self.tables.lock();
        let execution =
            tables.executions.iter_mut().find(|x| x.id == id).ok_or(DbError::NotFound)?;
        if execution.state == ExecutionState::Finished {
            return Err(DbError::ExecutionFinished);
        }
        merge_object(&mut execution.tags, tags);
        Ok(execution.clone())
    }

    async fn finish_execution(
        &self,
        finish: FinishExecution,
    ) -> Result<Option<StageExecutionRow>, DbError> {
        let mut tables = self.tables.lock();
        let Some(execution) = tables
            .executions
            .iter_mut()
            .find(|x| x.id == finish.execution_id && x.state == ExecutionState::Started)
        else {
            return Ok(None);
        };

        execution.state = ExecutionState::Finished;
        execution.result = Some(finish.result);
        execution.finished_at = Some(finish.finished_at);
        if let Some(outputs) = finish.outputs {
            merge_object(&mut execution.outputs, outputs);
        }
        let execution = execution.clone();

        if let Some(event) =
            tables.stage_events.iter_mut().find(|e| e.id == execution.stage_event_id)
        {
            event.state = StageEventState::Processed;
            event.state_reason = None;
        }

        let state = TagState::from(finish.result);
        let mut extra: BTreeMap<String, String> = finish.tags;
        for tag in tables.tags.iter_mut().filter(|t| t.stage_event_id == execution.stage_event_id) {
            if let Some(value) = extra.remove(&tag.name) {
                tag.value = value;
            }
            tag.state = state;
        }
        for (name, value) in extra {
            tables.tags.push(StageEventTagRow {
                stage_event_id: execution.stage_event_id,
                name,
                value,
                state,
            });
        }

        insert_raw_event(&mut tables, finish.completion);
        Ok(Some(execution))
    }

    async fn last_finished_execution(
        &self,
        stage_id: Uuid,
        results: &[ExecutionResult],
    ) -> Result<Option<StageExecutionRow>, DbError> {
        let tables = self.tables.lock();
        Ok(tables
            .executions
            .iter()
            .filter(|x| {
                x.stage_id == stage_id
                    && x.state == ExecutionState::Finished
                    && x.result.map_or(false, |r| results.contains(&r))
            })
            .max_by_key(|x| x.finished_at)
            .cloned())
    }
}
