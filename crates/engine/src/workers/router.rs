//! Raw-event router: fans every pending raw event out to the stages
//! connected to its source.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use bus::Message;
use db::models::{RawEventRow, RawEventState, StageEventRow, StageEventState, StageEventStateReason};
use db::{NewStageEvent, RoutingOutcome};

use crate::context::Services;
use crate::filters::EventView;
use crate::inputs::{Completeness, InputBuilder};
use crate::models::{Connection, Stage};
use crate::workers::{log_row_error, next_cursor, publish};
use crate::EngineError;

/// Page size when reading the `waiting / connection` events of a stage.
const WAITING_PAGE_SIZE: i64 = 500;

pub struct Router {
    services: Services,
}

impl Router {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn run(self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.services.config.router_interval;
        super::run_periodic("router", interval, shutdown, || self.tick()).await;
    }

    /// Route one batch of pending raw events.
    pub async fn tick(&self) -> Result<usize, EngineError> {
        let events = self
            .services
            .store
            .list_raw_events(RawEventState::Pending, self.services.config.batch_size)
            .await?;

        let mut routed = 0;
        for event in &events {
            match self.route(event).await {
                Ok(true) => routed += 1,
                Ok(false) => {}
                Err(err) => log_row_error("routing raw event", event.id, &err),
            }
        }
        Ok(routed)
    }

    /// Route a single raw event. Returns `false` if another router got to
    /// it first.
    #[instrument(skip_all, fields(event_id = %event.id, source_id = %event.source_id))]
    pub async fn route(&self, event: &RawEventRow) -> Result<bool, EngineError> {
        let store = self.services.store.as_ref();
        let rows = store.list_stages_connected_to(event.source_id, event.source_type).await?;

        if rows.is_empty() {
            info!("unconnected source, discarding event");
            return Ok(store.commit_routing(event.id, RoutingOutcome::Discarded).await?.is_some());
        }

        let view = EventView::new(&event.raw, &event.headers);
        let mut canvases = HashMap::new();
        let mut plans = Vec::new();

        for row in &rows {
            let stage = match Stage::try_from(row) {
                Ok(stage) => stage,
                Err(err) => {
                    error!(stage_id = %row.id, error = %err, "skipping undecodable stage");
                    continue;
                }
            };

            match self.plan(&stage, event, &view).await {
                Ok(Some(plan)) => {
                    canvases.insert(stage.id, stage.canvas_id);
                    plans.push(plan);
                }
                Ok(None) => {}
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    error!(stage_id = %stage.id, error = %err, "could not create stage event");
                }
            }
        }

        if plans.is_empty() {
            info!("no stage accepted the event");
        }

        let Some(created) = store.commit_routing(event.id, RoutingOutcome::Processed(plans)).await?
        else {
            debug!("event already routed");
            return Ok(false);
        };

        for stage_event in &created {
            self.announce(stage_event, canvases.get(&stage_event.stage_id).copied()).await;
        }
        info!(stage_events = created.len(), "event processed");
        Ok(true)
    }

    async fn announce(&self, stage_event: &StageEventRow, canvas_id: Option<uuid::Uuid>) {
        info!(
            stage_id = %stage_event.stage_id,
            stage_event_id = %stage_event.id,
            state = %stage_event.state,
            "stage event created"
        );
        let Some(canvas_id) = canvas_id else { return };
        publish(
            self.services.bus.as_ref(),
            Message::StageEventCreated {
                canvas_id,
                stage_id: stage_event.stage_id,
                stage_event_id: stage_event.id,
                timestamp: stage_event.created_at,
            },
        )
        .await;
    }

    /// Decide what, if anything, this event becomes for one stage.
    async fn plan(
        &self,
        stage: &Stage,
        event: &RawEventRow,
        view: &EventView,
    ) -> Result<Option<NewStageEvent>, EngineError> {
        let Some(connection) = accepting_connection(stage, event, view) else {
            return Ok(None);
        };

        if stage.is_fan_in() {
            return self.plan_fan_in(stage, connection, view).await.map(Some);
        }

        let events = HashMap::from([(connection.name.clone(), view.clone())]);
        let inputs = InputBuilder::new(
            self.services.store.as_ref(),
            self.services.encryptor.as_ref(),
            stage,
        )
        .build(&connection.name, &events, Completeness::Required)
        .await?;

        Ok(Some(NewStageEvent {
            stage_id: stage.id,
            tags: tags_for(stage, view)?,
            inputs: Value::Object(inputs),
            state: StageEventState::Pending,
            state_reason: None,
            cancels: Vec::new(),
        }))
    }

    /// A fan-in stage runs once every connection its inputs read from has
    /// fired. Until then its events wait; the event completing the set
    /// supersedes the waiting ones.
    async fn plan_fan_in(
        &self,
        stage: &Stage,
        connection: &Connection,
        view: &EventView,
    ) -> Result<NewStageEvent, EngineError> {
        let store = self.services.store.as_ref();
        let mut waiting: Vec<StageEventRow> = Vec::new();
        let mut after = None;
        loop {
            let page = store
                .list_stage_events(
                    Some(stage.id),
                    (StageEventState::Waiting, Some(StageEventStateReason::Connection)),
                    after,
                    WAITING_PAGE_SIZE,
                )
                .await?;
            after = next_cursor(&page, WAITING_PAGE_SIZE, |e| (e.created_at, e.id));
            waiting.extend(page);
            if after.is_none() {
                break;
            }
        }

        let others: Vec<&str> = stage
            .event_data_connections()
            .into_iter()
            .filter(|name| *name != connection.name)
            .collect();

        let mut events = HashMap::from([(connection.name.clone(), view.clone())]);
        let mut complete = true;
        for name in &others {
            // Newest waiting event from that connection, if any.
            let latest = waiting.iter().rev().find(|e| e.source_name == *name);
            complete &= latest.is_some();

            let raw = match latest {
                Some(stage_event) => Some(store.find_raw_event(stage_event.raw_event_id).await?),
                None => match stage.connection_named(name) {
                    Some(upstream) => {
                        store
                            .latest_raw_event_for_source(upstream.source_id, upstream.source_type)
                            .await?
                    }
                    None => None,
                },
            };
            if let Some(raw) = raw {
                events.insert(name.to_string(), EventView::new(&raw.raw, &raw.headers));
            }
        }

        let completeness = if complete { Completeness::Required } else { Completeness::Partial };
        let inputs = InputBuilder::new(store, self.services.encryptor.as_ref(), stage)
            .build(&connection.name, &events, completeness)
            .await?;
        let tags = tags_for(stage, view)?;

        if complete {
            debug!(stage_id = %stage.id, superseded = waiting.len(), "all connections received");
            Ok(NewStageEvent {
                stage_id: stage.id,
                inputs: Value::Object(inputs),
                state: StageEventState::Pending,
                state_reason: None,
                tags,
                cancels: waiting.iter().map(|e| e.id).collect(),
            })
        } else {
            debug!(stage_id = %stage.id, connection = %connection.name, "waiting for other connections");
            Ok(NewStageEvent {
                stage_id: stage.id,
                inputs: Value::Object(inputs),
                state: StageEventState::Waiting,
                state_reason: Some(StageEventStateReason::Connection),
                tags,
                cancels: Vec::new(),
            })
        }
    }
}

/// The first connection from the event's source whose filters pass. A
/// filter error counts as not passing.
fn accepting_connection<'a>(
    stage: &'a Stage,
    event: &RawEventRow,
    view: &EventView,
) -> Option<&'a Connection> {
    for connection in stage.connections_from(event.source_id, event.source_type) {
        match connection.accepts(view) {
            Ok(true) => return Some(connection),
            Ok(false) => {
                debug!(stage_id = %stage.id, connection = %connection.name, "filters did not pass");
            }
            Err(err) => {
                warn!(
                    stage_id = %stage.id,
                    connection = %connection.name,
                    error = %err,
                    "filter evaluation failed"
                );
            }
        }
    }
    None
}

/// The stage's tag expressions evaluated against the triggering event.
/// Inputs never become tags: some of them carry secret values.
fn tags_for(stage: &Stage, view: &EventView) -> Result<BTreeMap<String, String>, EngineError> {
    let mut tags = BTreeMap::new();
    for tag in &stage.tags {
        match view.evaluate(&tag.value_from)? {
            Value::Null => {}
            Value::String(s) => {
                tags.insert(tag.name.clone(), s);
            }
            other => {
                tags.insert(tag.name.clone(), other.to_string());
            }
        }
    }
    Ok(tags)
}
