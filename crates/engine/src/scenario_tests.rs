//! End-to-end runs of the workers against the in-memory store and bus.
//!
//! Workers are ticked by hand so every step is deterministic.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router as HttpRouter};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use bus::{MemoryBus, RoutingKey};
use db::models::{
    ExecutionResult, ExecutionState, RawEventRow, RawEventState, SourceType, StageEventRow,
    StageEventState, StageEventStateReason, StageExecutionRow, TagState,
};
use db::{DbError, MemoryStore, NewRawEvent, Store};
use executors::mock::MockExecutor;
use executors::{ExecutorError, ExecutorRegistry, ExecutorResponse};

use crate::canvas::{apply_canvas, AppliedCanvas, CanvasFile};
use crate::clock::{Clock, MockClock};
use crate::context::Services;
use crate::models::Stage;
use crate::secrets::NoOpEncryptor;
use crate::token::TokenSigner;
use crate::workers::{
    approve_stage_event, completion, ApprovalListener, Dispatcher, GateEvaluator, Reconciler, Router,
    TimeWindowListener,
};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    bus: Arc<MemoryBus>,
    clock: Arc<MockClock>,
    services: Services,
    canvas: AppliedCanvas,
}

/// Wednesday, inside business hours.
fn wednesday(hour: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, hour, 0, 0).unwrap()
}

fn mock_registry(executor: Arc<MockExecutor>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(executor);
    registry
}

impl Harness {
    /// A canvas with sources `S` and `T` and the given stages.
    async fn new(stages: Vec<Value>, registry: ExecutorRegistry) -> Self {
        Self::with_secrets(stages, registry, json!([])).await
    }

    async fn with_secrets(stages: Vec<Value>, registry: ExecutorRegistry, secrets: Value) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let clock = Arc::new(MockClock::new(wednesday(10)));

        let file: CanvasFile = serde_json::from_value(json!({
            "name": "delivery",
            "organization_id": Uuid::new_v4(),
            "sources": [{ "name": "S", "key": "k1" }, { "name": "T", "key": "k2" }],
            "secrets": secrets,
            "stages": stages,
        }))
        .unwrap();
        let canvas = apply_canvas(store.as_ref(), bus.as_ref(), &NoOpEncryptor, &registry, &file)
            .await
            .unwrap();

        let services = Services::new(
            store.clone() as Arc<dyn Store>,
            bus.clone(),
            registry,
            TokenSigner::new("test-secret"),
        )
        .with_clock(clock.clone());

        Self { store, bus, clock, services, canvas }
    }

    async fn ingest(&self, source: &str, body: Value) -> Uuid {
        self.store
            .create_raw_event(NewRawEvent {
                source_id: self.canvas.sources[source],
                source_name: source.to_string(),
                source_type: SourceType::EventSource,
                raw: serde_json::to_vec(&body).unwrap(),
                headers: json!({ "X-GitHub-Event": "push" }),
            })
            .await
            .unwrap()
            .id
    }

    async fn route(&self) -> usize {
        Router::new(self.services.clone()).tick().await.unwrap()
    }

    async fn gates(&self) -> usize {
        GateEvaluator::new(self.services.clone()).tick().await.unwrap()
    }

    async fn dispatch(&self) -> usize {
        Dispatcher::new(self.services.clone()).tick().await.unwrap()
    }

    async fn reconcile(&self) -> usize {
        Reconciler::new(self.services.clone()).tick().await.unwrap()
    }

    async fn raw_event(&self, id: Uuid) -> RawEventRow {
        self.store.find_raw_event(id).await.unwrap()
    }

    async fn stage_events(&self, stage: &str) -> Vec<StageEventRow> {
        self.store.list_stage_events_for_stage(self.canvas.stages[stage]).await.unwrap()
    }

    async fn executions(&self, stage: &str) -> Vec<StageExecutionRow> {
        self.store.list_executions_for_stage(self.canvas.stages[stage]).await.unwrap()
    }

    async fn tag_states(&self, stage_event_id: Uuid) -> Vec<(String, String, TagState)> {
        self.store
            .list_stage_event_tags(stage_event_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.name, t.value, t.state))
            .collect()
    }

    async fn active_executions(&self, stage: &str) -> usize {
        self.executions(stage)
            .await
            .iter()
            .filter(|x| matches!(x.state, ExecutionState::Pending | ExecutionState::Started))
            .count()
    }

    /// Pending completion events emitted by stages.
    async fn completions(&self) -> Vec<Value> {
        self.store
            .list_raw_events(RawEventState::Pending, 100)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.source_type == SourceType::Stage)
            .map(|e| serde_json::from_slice(&e.raw).unwrap())
            .collect()
    }
}

fn stage(name: &str, connections: Value) -> Value {
    json!({ "name": name, "connections": connections, "executor_spec": { "type": "mock" } })
}

fn from_source(source: &str) -> Value {
    json!([{ "name": source, "type": "event_source" }])
}

/// A stage that takes `VERSION` from the `ref` of `S` events and tags its
/// events with it.
fn versioned(name: &str) -> Value {
    let mut stage = stage(name, from_source("S"));
    stage["inputs"] = json!([{ "name": "VERSION" }]);
    stage["tags"] = json!([{ "name": "VERSION", "value_from": "ref" }]);
    stage["input_mappings"] = json!([{ "values": [{
        "name": "VERSION",
        "value_from": { "event_data": { "connection": "S", "expression": "ref" } },
    }] }]);
    stage
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_source_fans_out_to_every_connected_stage() {
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(
        vec![stage("A", from_source("S")), stage("B", from_source("S"))],
        mock_registry(executor),
    )
    .await;

    let raw = h.ingest("S", json!({ "ref": "v1" })).await;
    assert_eq!(h.route().await, 1);

    for name in ["A", "B"] {
        let events = h.stage_events(name).await;
        assert_eq!(events.len(), 1, "stage {name}");
        assert_eq!(events[0].inputs, json!({}));
        assert_eq!(events[0].status(), (StageEventState::Pending, None));
        assert_eq!(events[0].source_name, "S");
    }
    assert_eq!(h.raw_event(raw).await.state, RawEventState::Processed);
    assert_eq!(h.bus.published_with(RoutingKey::StageEventCreated).len(), 2);
}

#[tokio::test]
async fn data_filters_route_selectively() {
    let filtered = |name: &str, version: &str| {
        stage(
            name,
            json!([{
                "name": "S",
                "type": "event_source",
                "filters": [{ "type": "data", "expression": format!("ref == \"{version}\"") }],
            }]),
        )
    };
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![filtered("A", "v1"), filtered("B", "v2")], mock_registry(executor))
        .await;

    let raw = h.ingest("S", json!({ "ref": "v1" })).await;
    h.route().await;

    assert_eq!(h.stage_events("A").await.len(), 1);
    assert!(h.stage_events("B").await.is_empty());
    assert_eq!(h.raw_event(raw).await.state, RawEventState::Processed);
}

#[tokio::test]
async fn header_filters_are_case_insensitive() {
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(
        vec![stage(
            "A",
            json!([{
                "name": "S",
                "type": "event_source",
                "filters": [{ "type": "header", "expression": "headers[\"x-github-event\"] == \"push\"" }],
            }]),
        )],
        mock_registry(executor),
    )
    .await;

    h.ingest("S", json!({})).await;
    h.route().await;
    assert_eq!(h.stage_events("A").await.len(), 1);
}

#[tokio::test]
async fn approval_gate_waits_for_distinct_requesters() {
    let mut gated = stage("A", from_source("S"));
    gated["conditions"] = json!([{ "type": "approval", "count": 2 }]);
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![gated], mock_registry(executor)).await;
    let listener = ApprovalListener::new(h.services.clone());

    h.ingest("S", json!({ "ref": "v1" })).await;
    h.route().await;
    h.gates().await;

    let event = h.stage_events("A").await.remove(0);
    let waiting = (StageEventState::Waiting, Some(StageEventStateReason::Approval));
    assert_eq!(h.store.find_stage_event(event.id).await.unwrap().status(), waiting);

    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    approve_stage_event(h.store.as_ref(), h.bus.as_ref(), event.id, alice).await.unwrap();
    assert!(!listener.handle(event.id).await.unwrap());
    assert_eq!(h.store.find_stage_event(event.id).await.unwrap().status(), waiting);

    // The same requester twice does not count.
    let again = approve_stage_event(h.store.as_ref(), h.bus.as_ref(), event.id, alice).await;
    assert!(matches!(again, Err(EngineError::Database(DbError::AlreadyApproved))));

    approve_stage_event(h.store.as_ref(), h.bus.as_ref(), event.id, bob).await.unwrap();
    assert!(listener.handle(event.id).await.unwrap());
    assert_eq!(
        h.store.find_stage_event(event.id).await.unwrap().status(),
        (StageEventState::Pending, None)
    );
    // Redelivery of the same approval message is a no-op.
    assert!(!listener.handle(event.id).await.unwrap());

    h.gates().await;
    let executions = h.executions("A").await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].state, ExecutionState::Pending);
    assert_eq!(h.bus.published_with(RoutingKey::StageEventApproved).len(), 2);
}

#[tokio::test]
async fn processed_events_cannot_be_approved() {
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![stage("A", from_source("S"))], mock_registry(executor)).await;

    h.ingest("S", json!({})).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;

    let event = h.stage_events("A").await.remove(0);
    assert_eq!(event.state, StageEventState::Processed);
    let result = approve_stage_event(h.store.as_ref(), h.bus.as_ref(), event.id, Uuid::new_v4()).await;
    assert!(matches!(result, Err(EngineError::InvalidState { .. })));
}

#[tokio::test]
async fn time_window_gate_reopens_when_the_clock_enters_the_window() {
    let mut gated = stage("A", from_source("S"));
    gated["conditions"] = json!([{
        "type": "time_window",
        "start": "08:00",
        "end": "17:00",
        "week_days": ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"],
    }]);
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![gated], mock_registry(executor)).await;
    let listener = TimeWindowListener::new(h.services.clone());
    h.clock.set(wednesday(2));

    h.ingest("S", json!({})).await;
    h.route().await;
    h.gates().await;

    let event = h.stage_events("A").await.remove(0);
    assert_eq!(event.status(), (StageEventState::Waiting, Some(StageEventStateReason::TimeWindow)));

    // Still closed.
    assert_eq!(listener.tick().await.unwrap(), 0);

    h.clock.set(wednesday(10));
    assert_eq!(listener.tick().await.unwrap(), 1);
    assert_eq!(
        h.store.find_stage_event(event.id).await.unwrap().status(),
        (StageEventState::Pending, None)
    );

    h.gates().await;
    assert_eq!(h.executions("A").await.len(), 1);
}

type Seen = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

async fn spawn_hook(reply: Value) -> (String, Seen) {
    let seen: Seen = Arc::default();
    let app = HttpRouter::new()
        .route(
            "/deploy",
            post(move |State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>| {
                let reply = reply.clone();
                async move {
                    seen.lock().push((headers, body));
                    (StatusCode::OK, Json(reply))
                }
            }),
        )
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{addr}/deploy"), seen)
}

#[tokio::test]
async fn synchronous_http_executor_finishes_inline() {
    let (url, seen) = spawn_hook(json!({ "outputs": { "foo": "bar" } })).await;
    let mut deploy = versioned("A");
    deploy["outputs"] = json!([{ "name": "foo", "required": true }]);
    deploy["secrets"] = json!([{
        "name": "TOKEN",
        "value_from": { "secret": { "name": "creds", "key": "token" } },
    }]);
    deploy["executor_spec"] = json!({
        "type": "http",
        "url": url,
        "headers": { "Authorization": "Bearer ${{ secrets.TOKEN }}" },
        "payload": { "version": "${{ inputs.VERSION }}" },
    });

    let registry = ExecutorRegistry::with_builtin(Duration::from_secs(5)).unwrap();
    let h = Harness::with_secrets(
        vec![deploy],
        registry,
        json!([{ "name": "creds", "values": { "token": "s3cr3t" } }]),
    )
    .await;

    h.ingest("S", json!({ "ref": "v1" })).await;
    h.route().await;
    h.gates().await;
    assert_eq!(h.dispatch().await, 1);

    let execution = h.executions("A").await.remove(0);
    assert_eq!(execution.state, ExecutionState::Finished);
    assert_eq!(execution.result, Some(ExecutionResult::Passed));
    assert_eq!(execution.outputs, json!({ "foo": "bar" }));

    let (headers, body) = seen.lock()[0].clone();
    assert_eq!(headers["authorization"], "Bearer s3cr3t");
    assert_eq!(body["version"], "v1");
    assert_eq!(body["execution_id"], execution.id.to_string());

    let event = h.stage_events("A").await.remove(0);
    assert_eq!(event.state, StageEventState::Processed);
    assert_eq!(
        h.tag_states(event.id).await,
        vec![("VERSION".to_string(), "v1".to_string(), TagState::Healthy)]
    );

    let completions = h.completions().await;
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0]["type"], "StageExecutionCompletion");
    assert_eq!(completions[0]["execution"]["result"], "passed");
    assert_eq!(completions[0]["outputs"]["foo"], "bar");
    assert_eq!(completions[0]["stage"]["name"], "A");
}

#[derive(Clone, Default)]
struct FakeSemaphore {
    pipeline: Arc<Mutex<(String, String)>>,
}

async fn spawn_semaphore(fake: FakeSemaphore) -> String {
    let app = HttpRouter::new()
        .route(
            "/api/v2/projects/:project/tasks/:task/triggers",
            post(|| async { Json(json!({ "metadata": { "workflow_id": "wf-42", "status": "PASSED" } })) }),
        )
        .route(
            "/api/v2/workflows/:id",
            get(|Path(id): Path<String>| async move {
                Json(json!({ "initial_ppl_id": format!("ppl-of-{id}") }))
            }),
        )
        .route(
            "/api/v1alpha/pipelines/:id",
            get(|State(fake): State<FakeSemaphore>, Path(id): Path<String>| async move {
                let (state, result) = fake.pipeline.lock().clone();
                Json(json!({ "pipeline": { "ppl_id": id, "wf_id": "wf-42", "state": state, "result": result } }))
            }),
        )
        .with_state(fake);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

#[tokio::test]
async fn failed_async_task_marks_tags_unhealthy() {
    let fake = FakeSemaphore::default();
    *fake.pipeline.lock() = ("running".into(), String::new());
    let url = spawn_semaphore(fake.clone()).await;

    let mut deploy = versioned("A");
    deploy["executor_spec"] = json!({
        "type": "semaphore",
        "organization_url": url,
        "api_token": "api",
        "project_id": "p1",
        "task_id": "t1",
        "parameters": { "VERSION": "${{ inputs.VERSION }}" },
    });
    let registry = ExecutorRegistry::with_builtin(Duration::from_secs(5)).unwrap();
    let h = Harness::new(vec![deploy], registry).await;

    h.ingest("S", json!({ "ref": "v1" })).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;

    let execution = h.executions("A").await.remove(0);
    assert_eq!(execution.state, ExecutionState::Started);
    assert_eq!(execution.reference_id.as_deref(), Some("wf-42"));
    assert_eq!(h.bus.published_with(RoutingKey::ExecutionStarted).len(), 1);

    // Still running: nothing changes.
    assert_eq!(h.reconcile().await, 0);
    assert_eq!(h.active_executions("A").await, 1);

    *fake.pipeline.lock() = ("done".into(), "failed".into());
    assert_eq!(h.reconcile().await, 1);

    let execution = h.executions("A").await.remove(0);
    assert_eq!(execution.state, ExecutionState::Finished);
    assert_eq!(execution.result, Some(ExecutionResult::Failed));

    let event = h.stage_events("A").await.remove(0);
    assert!(h.tag_states(event.id).await.iter().all(|(_, _, state)| *state == TagState::Unhealthy));

    let completions = h.completions().await;
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0]["execution"]["result"], "failed");
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a_stage_never_runs_two_executions_at_once() {
    let executor = Arc::new(MockExecutor::starting("mock", "job-1"));
    let h = Harness::new(vec![stage("A", from_source("S"))], mock_registry(executor.clone())).await;

    h.ingest("S", json!({ "n": 1 })).await;
    h.ingest("S", json!({ "n": 2 })).await;
    h.route().await;
    assert_eq!(h.stage_events("A").await.len(), 2);

    for _ in 0..3 {
        h.gates().await;
        h.dispatch().await;
        assert!(h.active_executions("A").await <= 1);
    }
    assert_eq!(h.executions("A").await.len(), 1);

    executor.push_check(Ok(ExecutorResponse::finished(true, Map::new())));
    assert_eq!(h.reconcile().await, 1);
    assert_eq!(h.active_executions("A").await, 0);

    // The next event only now gets its turn, oldest first.
    h.gates().await;
    let executions = h.executions("A").await;
    assert_eq!(executions.len(), 2);
    let events = h.stage_events("A").await;
    assert_eq!(executions[1].stage_event_id, events[1].id);
}

#[tokio::test]
async fn every_raw_event_terminates() {
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![stage("A", from_source("S"))], mock_registry(executor)).await;

    let routed = h.ingest("S", json!({})).await;
    // Nothing listens to T.
    let unconnected = h.ingest("T", json!({})).await;
    h.route().await;

    assert_eq!(h.raw_event(routed).await.state, RawEventState::Processed);
    assert_eq!(h.raw_event(unconnected).await.state, RawEventState::Discarded);

    // A second router pass over the same event changes nothing.
    let row = h.raw_event(routed).await;
    assert!(!Router::new(h.services.clone()).route(&row).await.unwrap());
    assert_eq!(h.stage_events("A").await.len(), 1);
}

#[tokio::test]
async fn inputs_are_written_once() {
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![versioned("A")], mock_registry(executor.clone())).await;

    h.ingest("S", json!({ "ref": "v1" })).await;
    h.route().await;
    let created = h.stage_events("A").await.remove(0);

    h.gates().await;
    h.dispatch().await;

    let finished = h.stage_events("A").await.remove(0);
    assert_eq!(finished.inputs, json!({ "VERSION": "v1" }));
    assert_eq!(finished.inputs, created.inputs);
    assert_eq!(executor.calls.lock()[0], json!({ "type": "mock" }));
}

#[tokio::test]
async fn missing_required_output_fails_the_execution() {
    let mut producing = stage("A", from_source("S"));
    producing["outputs"] = json!([{ "name": "url", "required": true }, { "name": "notes", "required": false }]);
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({ "notes": "ok" })));
    let h = Harness::new(vec![producing], mock_registry(executor)).await;

    h.ingest("S", json!({})).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;

    let execution = h.executions("A").await.remove(0);
    assert_eq!(execution.result, Some(ExecutionResult::Failed));
    assert_eq!(execution.outputs, json!({ "notes": "ok" }));
}

#[tokio::test]
async fn pushed_outputs_count_towards_required_outputs() {
    let mut producing = stage("A", from_source("S"));
    producing["outputs"] = json!([{ "name": "url", "required": true }]);
    let executor = Arc::new(MockExecutor::starting("mock", "job-7"));
    let h = Harness::new(vec![producing], mock_registry(executor.clone())).await;

    h.ingest("S", json!({})).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;

    let execution = h.executions("A").await.remove(0);
    h.store.merge_execution_outputs(execution.id, json!({ "url": "https://app" })).await.unwrap();
    h.store.merge_execution_tags(execution.id, json!({ "env": "prod" })).await.unwrap();

    executor.push_check(Ok(ExecutorResponse::finished(true, Map::new())));
    h.reconcile().await;

    let execution = h.executions("A").await.remove(0);
    assert_eq!(execution.result, Some(ExecutionResult::Passed));
    let event = h.stage_events("A").await.remove(0);
    assert!(h
        .tag_states(event.id)
        .await
        .contains(&("env".to_string(), "prod".to_string(), TagState::Healthy)));
    assert_eq!(h.completions().await[0]["tags"]["env"], "prod");
}

#[tokio::test]
async fn tags_follow_the_execution_result() {
    let mut tagged = versioned("A");
    tagged["tags"] = json!([{ "name": "branch", "value_from": "branch" }]);
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![tagged], mock_registry(executor)).await;

    h.ingest("S", json!({ "ref": "v1", "branch": "main" })).await;
    h.route().await;
    let event = h.stage_events("A").await.remove(0);
    assert!(h.tag_states(event.id).await.iter().all(|(_, _, s)| *s == TagState::Unknown));

    h.gates().await;
    h.dispatch().await;
    assert_eq!(
        h.tag_states(event.id).await,
        vec![("branch".to_string(), "main".to_string(), TagState::Healthy)]
    );
}

#[tokio::test]
async fn secret_inputs_never_become_tags() {
    let mut deploy = stage("A", from_source("S"));
    deploy["inputs"] = json!([{ "name": "TOKEN" }]);
    deploy["input_mappings"] = json!([{ "values": [{
        "name": "TOKEN",
        "value_from": { "secret": { "name": "creds", "key": "token" } },
    }] }]);
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::with_secrets(
        vec![deploy],
        mock_registry(executor),
        json!([{ "name": "creds", "values": { "token": "s3cr3t" } }]),
    )
    .await;

    h.ingest("S", json!({ "ref": "v1" })).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;

    let event = h.stage_events("A").await.remove(0);
    assert_eq!(event.state, StageEventState::Processed);
    assert!(h.tag_states(event.id).await.is_empty());

    let completions = h.completions().await;
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0]["tags"], json!({}));
    assert!(!completions[0].to_string().contains("s3cr3t"));
}

#[tokio::test]
async fn invocation_errors_fail_the_execution() {
    let executor = Arc::new(MockExecutor::failing(
        "mock",
        ExecutorError::Rejected("no capacity".into()),
    ));
    let h = Harness::new(vec![versioned("A")], mock_registry(executor)).await;

    h.ingest("S", json!({ "ref": "v1" })).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;

    let execution = h.executions("A").await.remove(0);
    assert_eq!(execution.result, Some(ExecutionResult::Failed));
    let event = h.stage_events("A").await.remove(0);
    assert!(h.tag_states(event.id).await.iter().all(|(_, _, s)| *s == TagState::Unhealthy));
}

#[tokio::test]
async fn filter_errors_only_affect_their_own_stage() {
    let broken = stage(
        "A",
        json!([{
            "name": "S",
            "type": "event_source",
            // Comparing a string with a number is a type error.
            "filters": [{ "type": "data", "expression": "ref > 3" }],
        }]),
    );
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![broken, stage("B", from_source("S"))], mock_registry(executor)).await;

    let raw = h.ingest("S", json!({ "ref": "v1" })).await;
    h.route().await;

    assert!(h.stage_events("A").await.is_empty());
    assert_eq!(h.stage_events("B").await.len(), 1);
    assert_eq!(h.raw_event(raw).await.state, RawEventState::Processed);
}

#[tokio::test]
async fn completion_events_trigger_downstream_stages() {
    let mut downstream = stage(
        "B",
        json!([{
            "name": "A",
            "type": "stage",
            "filters": [{ "type": "data", "expression": "execution.result == \"passed\"" }],
        }]),
    );
    downstream["inputs"] = json!([{ "name": "URL" }]);
    downstream["input_mappings"] = json!([{ "values": [{
        "name": "URL",
        "value_from": { "event_data": { "connection": "A", "expression": "outputs.url" } },
    }] }]);

    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({ "url": "https://app" })));
    let h = Harness::new(vec![stage("A", from_source("S")), downstream], mock_registry(executor))
        .await;

    h.ingest("S", json!({})).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;
    assert_eq!(h.route().await, 1);

    let events = h.stage_events("B").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source_type, SourceType::Stage);
    assert_eq!(events[0].inputs, json!({ "URL": "https://app" }));
}

#[tokio::test]
async fn last_execution_inputs_carry_over() {
    // Pushes to S pick a version; a redeploy from T reuses the last good one.
    let mut deploy = stage(
        "A",
        json!([{ "name": "S", "type": "event_source" }, { "name": "T", "type": "event_source" }]),
    );
    deploy["inputs"] = json!([{ "name": "VERSION" }]);
    deploy["input_mappings"] = json!([
        {
            "when": { "triggered_by": { "connection": "S" } },
            "values": [{
                "name": "VERSION",
                "value_from": { "event_data": { "connection": "S", "expression": "ref" } },
            }],
        },
        {
            "when": { "triggered_by": { "connection": "T" } },
            "values": [{
                "name": "VERSION",
                "value_from": { "last_execution": { "results": ["passed"] } },
            }],
        },
    ]);
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![deploy], mock_registry(executor)).await;

    // Nothing has run yet, so the required input has no value.
    h.ingest("T", json!({})).await;
    h.route().await;
    assert!(h.stage_events("A").await.is_empty());

    h.ingest("S", json!({ "ref": "v7" })).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;

    h.ingest("T", json!({})).await;
    h.route().await;
    let events = h.stage_events("A").await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].inputs, json!({ "VERSION": "v7" }));
}

#[tokio::test]
async fn fan_in_waits_for_every_connection() {
    let mut release = stage(
        "R",
        json!([{ "name": "S", "type": "event_source" }, { "name": "T", "type": "event_source" }]),
    );
    release["inputs"] = json!([{ "name": "APP" }, { "name": "INFRA" }]);
    release["input_mappings"] = json!([{ "values": [
        { "name": "APP", "value_from": { "event_data": { "connection": "S", "expression": "ref" } } },
        { "name": "INFRA", "value_from": { "event_data": { "connection": "T", "expression": "ref" } } },
    ] }]);
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![release], mock_registry(executor)).await;

    h.ingest("S", json!({ "ref": "app-1" })).await;
    h.route().await;
    h.ingest("S", json!({ "ref": "app-2" })).await;
    h.route().await;

    let events = h.stage_events("R").await;
    assert_eq!(events.len(), 2);
    let waiting = (StageEventState::Waiting, Some(StageEventStateReason::Connection));
    assert!(events.iter().all(|e| e.status() == waiting));
    // Gates never see waiting events.
    assert_eq!(h.gates().await, 0);

    h.ingest("T", json!({ "ref": "infra-1" })).await;
    h.route().await;

    let events = h.stage_events("R").await;
    assert_eq!(events.len(), 3);
    let cancelled = (StageEventState::Processed, Some(StageEventStateReason::Cancelled));
    assert_eq!(events[0].status(), cancelled);
    assert_eq!(events[1].status(), cancelled);
    assert_eq!(events[2].status(), (StageEventState::Pending, None));
    // The newest waiting event supplies the other side.
    assert_eq!(events[2].inputs, json!({ "APP": "app-2", "INFRA": "infra-1" }));

    h.gates().await;
    assert_eq!(h.executions("R").await.len(), 1);
}

#[tokio::test]
async fn orphaned_executions_are_failed_after_the_timeout() {
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![stage("A", from_source("S"))], mock_registry(executor)).await;

    h.ingest("S", json!({})).await;
    h.route().await;
    h.gates().await;

    // Claimed, but the worker died before invoking the executor.
    let pending = h.executions("A").await.remove(0);
    h.store.start_execution(pending.id, h.clock.now()).await.unwrap();

    assert_eq!(h.reconcile().await, 0);
    h.clock.advance(chrono::Duration::minutes(11));
    assert_eq!(h.reconcile().await, 1);

    let execution = h.executions("A").await.remove(0);
    assert_eq!(execution.result, Some(ExecutionResult::Failed));
    assert_eq!(h.active_executions("A").await, 0);
}

#[tokio::test]
async fn redispatching_a_claimed_execution_is_a_no_op() {
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![stage("A", from_source("S"))], mock_registry(executor.clone())).await;

    h.ingest("S", json!({})).await;
    h.route().await;
    h.gates().await;

    let pending = h.executions("A").await.remove(0);
    let dispatcher = Dispatcher::new(h.services.clone());
    assert!(dispatcher.dispatch(&pending).await.unwrap());
    assert!(!dispatcher.dispatch(&pending).await.unwrap());
    assert_eq!(executor.call_count(), 1);
    assert_eq!(h.bus.published_with(RoutingKey::ExecutionFinished).len(), 1);
}

#[tokio::test]
async fn executors_receive_a_token_for_their_execution() {
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![stage("A", from_source("S"))], mock_registry(executor.clone())).await;
    // Tokens are checked against the wall clock.
    h.clock.set(Utc::now());

    h.ingest("S", json!({})).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;

    let ctx = executor.contexts.lock()[0].clone();
    let execution = h.executions("A").await.remove(0);
    assert_eq!(ctx.execution_id, execution.id);
    assert_eq!(ctx.stage_id, h.canvas.stages["A"]);
    assert!(h.services.signer.authorizes(&ctx.token, execution.id));
    assert!(!h.services.signer.authorizes(&ctx.token, Uuid::new_v4()));
}

// ---------------------------------------------------------------------------
// Paging and redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn time_window_listener_reaches_events_past_the_first_page() {
    let window = |name: &str, source: &str, days: Value| {
        let mut gated = stage(name, from_source(source));
        gated["conditions"] = json!([{
            "type": "time_window",
            "start": "08:00",
            "end": "17:00",
            "week_days": days,
        }]);
        gated
    };
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let mut h = Harness::new(
        vec![window("A", "S", json!(["Monday"])), window("B", "T", json!(["Wednesday"]))],
        mock_registry(executor),
    )
    .await;
    h.clock.set(wednesday(2));

    // A's events are older and stay closed all week.
    for n in 0..3 {
        h.ingest("S", json!({ "n": n })).await;
    }
    h.ingest("T", json!({})).await;
    h.route().await;
    while h.gates().await > 0 {}

    h.services.config.batch_size = 2;
    let listener = TimeWindowListener::new(h.services.clone());

    let parked = (StageEventState::Waiting, Some(StageEventStateReason::TimeWindow));
    assert!(h.stage_events("A").await.iter().all(|e| e.status() == parked));
    let event = h.stage_events("B").await.remove(0);
    assert_eq!(event.status(), parked);

    h.clock.set(wednesday(10));
    assert_eq!(listener.tick().await.unwrap(), 1);
    assert_eq!(
        h.store.find_stage_event(event.id).await.unwrap().status(),
        (StageEventState::Pending, None)
    );
    assert!(h.stage_events("A").await.iter().all(|e| e.status() == parked));
}

#[tokio::test]
async fn approval_sweep_releases_events_without_a_message() {
    let mut gated = stage("A", from_source("S"));
    gated["conditions"] = json!([{ "type": "approval", "count": 1 }]);
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let mut h = Harness::new(vec![gated], mock_registry(executor)).await;

    h.ingest("S", json!({ "n": 1 })).await;
    h.ingest("S", json!({ "n": 2 })).await;
    h.route().await;
    while h.gates().await > 0 {}

    h.services.config.batch_size = 1;
    let listener = ApprovalListener::new(h.services.clone());

    let events = h.stage_events("A").await;
    let waiting = (StageEventState::Waiting, Some(StageEventStateReason::Approval));
    assert!(events.iter().all(|e| e.status() == waiting));

    // Recorded, but the notification never reached the bus.
    h.store.create_approval(events[1].id, Uuid::new_v4()).await.unwrap();
    assert!(h.bus.published_with(RoutingKey::StageEventApproved).is_empty());

    assert_eq!(listener.sweep().await.unwrap(), 1);
    assert_eq!(h.store.find_stage_event(events[0].id).await.unwrap().status(), waiting);
    assert_eq!(
        h.store.find_stage_event(events[1].id).await.unwrap().status(),
        (StageEventState::Pending, None)
    );
    // Nothing left to release.
    assert_eq!(listener.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn reconciler_polls_executions_past_the_first_page() {
    let executor = Arc::new(MockExecutor::starting("mock", "job"));
    let mut h = Harness::new(
        vec![
            stage("A", from_source("S")),
            stage("B", from_source("S")),
            stage("C", from_source("S")),
        ],
        mock_registry(executor.clone()),
    )
    .await;
    h.services.config.batch_size = 1;

    h.ingest("S", json!({})).await;
    h.route().await;
    assert_eq!(h.gates().await, 3);
    // Every pending execution is dispatched in one pass.
    assert_eq!(h.dispatch().await, 3);
    assert_eq!(executor.call_count(), 3);

    // The oldest one keeps running; the others are done.
    executor.push_check(Ok(ExecutorResponse::running("job")));
    executor.push_check(Ok(ExecutorResponse::finished(true, Map::new())));
    executor.push_check(Ok(ExecutorResponse::finished(true, Map::new())));
    assert_eq!(h.reconcile().await, 2);

    let active: usize = [
        h.active_executions("A").await,
        h.active_executions("B").await,
        h.active_executions("C").await,
    ]
    .iter()
    .sum();
    assert_eq!(active, 1);
    assert_eq!(h.completions().await.len(), 2);
}

#[tokio::test]
async fn routing_the_same_raw_event_twice_creates_one_stage_event() {
    let executor = Arc::new(MockExecutor::finishing("mock", true, json!({})));
    let h = Harness::new(vec![stage("A", from_source("S"))], mock_registry(executor)).await;

    let raw = h.ingest("S", json!({ "ref": "v1" })).await;
    // Both deliveries carry the row as it was read before routing.
    let row = h.raw_event(raw).await;
    let router = Router::new(h.services.clone());
    assert!(router.route(&row).await.unwrap());
    assert!(!router.route(&row).await.unwrap());

    assert_eq!(h.stage_events("A").await.len(), 1);
    assert_eq!(h.bus.published_with(RoutingKey::StageEventCreated).len(), 1);
    assert_eq!(h.raw_event(raw).await.state, RawEventState::Processed);

    h.gates().await;
    h.dispatch().await;
    assert_eq!(h.executions("A").await.len(), 1);
    assert_eq!(h.completions().await.len(), 1);
}

#[tokio::test]
async fn finishing_an_execution_twice_emits_one_completion() {
    let executor = Arc::new(MockExecutor::starting("mock", "job-9"));
    let h = Harness::new(vec![stage("A", from_source("S"))], mock_registry(executor)).await;

    h.ingest("S", json!({})).await;
    h.route().await;
    h.gates().await;
    h.dispatch().await;

    let execution = h.executions("A").await.remove(0);
    assert_eq!(execution.state, ExecutionState::Started);
    let stage = Stage::try_from(&h.store.find_stage(execution.stage_id).await.unwrap()).unwrap();

    let first = completion::finish(&h.services, &stage, execution.id, true, Map::new())
        .await
        .unwrap();
    assert!(first.is_some());
    let second = completion::finish(&h.services, &stage, execution.id, false, Map::new())
        .await
        .unwrap();
    assert!(second.is_none());

    assert_eq!(h.stage_events("A").await.len(), 1);
    let executions = h.executions("A").await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].result, Some(ExecutionResult::Passed));
    assert_eq!(h.completions().await.len(), 1);
    assert_eq!(h.bus.published_with(RoutingKey::ExecutionFinished).len(), 1);
}
