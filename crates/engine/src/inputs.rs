//! Computes a stage-event's inputs from the stage's input mappings.

use std::collections::HashMap;

use serde_json::{Map, Value};

use db::Store;

use crate::filters::EventView;
use crate::models::{LastExecutionRef, Stage, ValueDefinition, ValueFrom};
use crate::secrets::{self, Encryptor};
use crate::EngineError;

/// How strictly missing values are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// Every required input must be present.
    Required,
    /// Values from connections that have not fired yet may be missing.
    Partial,
}

pub struct InputBuilder<'a> {
    store: &'a dyn Store,
    encryptor: &'a dyn Encryptor,
    stage: &'a Stage,
}

impl<'a> InputBuilder<'a> {
    pub fn new(store: &'a dyn Store, encryptor: &'a dyn Encryptor, stage: &'a Stage) -> Self {
        Self { store, encryptor, stage }
    }

    /// Build inputs for an event that arrived via `connection`. `events`
    /// holds the event seen on each connection, keyed by connection name.
    pub async fn build(
        &self,
        connection: &str,
        events: &HashMap<String, EventView>,
        completeness: Completeness,
    ) -> Result<Map<String, Value>, EngineError> {
        let mut inputs = Map::new();
        if self.stage.inputs.is_empty() {
            return Ok(inputs);
        }

        let values = self
            .stage
            .input_mappings
            .iter()
            .find(|m| m.applies_to(connection))
            .map(|m| m.values.as_slice())
            .unwrap_or_default();

        for definition in values {
            // Values for undeclared inputs are dropped.
            if self.stage.input(&definition.name).is_none() {
                continue;
            }
            if let Some(value) = self.value(definition, events).await? {
                inputs.insert(definition.name.clone(), value);
            }
        }

        if completeness == Completeness::Required {
            if let Some(missing) =
                self.stage.inputs.iter().find(|i| i.required && !inputs.contains_key(&i.name))
            {
                return Err(EngineError::MissingInput(missing.name.clone()));
            }
        }

        Ok(inputs)
    }

    async fn value(
        &self,
        definition: &ValueDefinition,
        events: &HashMap<String, EventView>,
    ) -> Result<Option<Value>, EngineError> {
        if let Some(value) = &definition.value {
            return Ok(Some(Value::String(value.clone())));
        }

        match &definition.value_from {
            Some(ValueFrom::EventData(reference)) => match events.get(&reference.connection) {
                Some(event) => Ok(as_input(event.evaluate(&reference.expression)?)),
                None => Ok(None),
            },
            Some(ValueFrom::LastExecution(reference)) => {
                self.last_execution_value(&definition.name, reference).await
            }
            Some(ValueFrom::Secret(reference)) => {
                secrets::resolve_key(self.store, self.encryptor, self.stage.canvas_id, reference)
                    .await
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    /// The same-named input of the stage's latest matching execution.
    async fn last_execution_value(
        &self,
        name: &str,
        reference: &LastExecutionRef,
    ) -> Result<Option<Value>, EngineError> {
        let Some(execution) =
            self.store.last_finished_execution(self.stage.id, &reference.results).await?
        else {
            return Ok(None);
        };
        let event = self.store.find_stage_event(execution.stage_event_id).await?;
        Ok(event.inputs.get(name).cloned().filter(|v| !v.is_null()))
    }
}

/// Inputs are strings; scalars are rendered, `null` means absent.
fn as_input(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(_) => Some(value),
        other => Some(Value::String(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use db::models::{ExecutionResult, StageEventState};
    use db::{
        FinishExecution, MemoryStore, NewCanvas, NewRawEvent, NewStage, NewStageEvent,
        RoutingOutcome,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    use crate::secrets::NoOpEncryptor;

    async fn stage(store: &MemoryStore, inputs: Value, input_mappings: Value) -> Stage {
        let canvas = store
            .create_canvas(NewCanvas { organization_id: Uuid::new_v4(), name: "c".into() })
            .await
            .unwrap();
        let row = store
            .create_stage(NewStage {
                canvas_id: canvas.id,
                name: "deploy".into(),
                conditions: json!([]),
                connections: json!([
                    { "name": "gh", "source_id": Uuid::new_v4(), "source_type": "event_source" },
                    { "name": "ci", "source_id": Uuid::new_v4(), "source_type": "event_source" }
                ]),
                inputs,
                input_mappings,
                outputs: json!([]),
                secrets: json!([]),
                tags: json!([]),
                executor_spec: json!({ "type": "http", "url": "http://localhost" }),
            })
            .await
            .unwrap();
        Stage::try_from(&row).unwrap()
    }

    fn events(connection: &str, body: Value) -> HashMap<String, EventView> {
        HashMap::from([(
            connection.to_string(),
            EventView::new(body.to_string().as_bytes(), &json!({})),
        )])
    }

    #[tokio::test]
    async fn picks_the_mapping_for_the_triggering_connection() {
        let store = MemoryStore::new();
        let stage = stage(
            &store,
            json!([{ "name": "VERSION" }, { "name": "ENV", "required": false }]),
            json!([
                { "when": { "triggered_by": { "connection": "gh" } },
                  "values": [
                    { "name": "VERSION", "value_from": { "event_data": { "connection": "gh", "expression": "ref" } } },
                    { "name": "ENV", "value": "prod" },
                    { "name": "UNDECLARED", "value": "x" }
                  ] },
                { "values": [{ "name": "VERSION", "value": "manual" }] }
            ]),
        )
        .await;
        let builder = InputBuilder::new(&store, &NoOpEncryptor, &stage);

        let inputs = builder
            .build("gh", &events("gh", json!({ "ref": "v1" })), Completeness::Required)
            .await
            .unwrap();
        assert_eq!(Value::Object(inputs), json!({ "VERSION": "v1", "ENV": "prod" }));

        let inputs = builder
            .build("ci", &events("ci", json!({})), Completeness::Required)
            .await
            .unwrap();
        assert_eq!(Value::Object(inputs), json!({ "VERSION": "manual" }));
    }

    #[tokio::test]
    async fn missing_required_inputs_fail_unless_partial() {
        let store = MemoryStore::new();
        let stage = stage(
            &store,
            json!([{ "name": "VERSION" }, { "name": "SHA" }]),
            json!([{ "values": [
                { "name": "VERSION", "value_from": { "event_data": { "connection": "gh", "expression": "ref" } } },
                { "name": "SHA", "value_from": { "event_data": { "connection": "ci", "expression": "sha" } } }
            ] }]),
        )
        .await;
        let builder = InputBuilder::new(&store, &NoOpEncryptor, &stage);
        let gh = events("gh", json!({ "ref": "v1" }));

        let err = builder.build("gh", &gh, Completeness::Required).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingInput(ref name) if name == "SHA"));

        let partial = builder.build("gh", &gh, Completeness::Partial).await.unwrap();
        assert_eq!(Value::Object(partial), json!({ "VERSION": "v1" }));
    }

    #[tokio::test]
    async fn non_string_values_are_rendered() {
        let store = MemoryStore::new();
        let stage = stage(
            &store,
            json!([{ "name": "COUNT" }]),
            json!([{ "values": [
                { "name": "COUNT", "value_from": { "event_data": { "connection": "gh", "expression": "len(commits)" } } }
            ] }]),
        )
        .await;
        let inputs = InputBuilder::new(&store, &NoOpEncryptor, &stage)
            .build("gh", &events("gh", json!({ "commits": [1, 2] })), Completeness::Required)
            .await
            .unwrap();
        assert_eq!(inputs.get("COUNT"), Some(&json!("2")));
    }

    #[tokio::test]
    async fn reads_inputs_of_the_last_matching_execution() {
        let store = MemoryStore::new();
        let stage = stage(
            &store,
            json!([{ "name": "VERSION" }]),
            json!([{ "values": [
                { "name": "VERSION", "value_from": { "last_execution": { "results": ["passed"] } } }
            ] }]),
        )
        .await;
        let builder = InputBuilder::new(&store, &NoOpEncryptor, &stage);
        let err = builder.build("gh", &HashMap::new(), Completeness::Required).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingInput(_)));

        // Run one execution to completion with VERSION=v7.
        let raw = store
            .create_raw_event(NewRawEvent {
                source_id: stage.connections[0].source_id,
                source_name: "gh".into(),
                source_type: db::models::SourceType::EventSource,
                raw: b"{}".to_vec(),
                headers: json!({}),
            })
            .await
            .unwrap();
        let created = store
            .commit_routing(
                raw.id,
                RoutingOutcome::Processed(vec![NewStageEvent {
                    stage_id: stage.id,
                    inputs: json!({ "VERSION": "v7" }),
                    state: StageEventState::Pending,
                    state_reason: None,
                    tags: BTreeMap::new(),
                    cancels: vec![],
                }]),
            )
            .await
            .unwrap()
            .unwrap();
        let execution = store.create_execution(created[0].id).await.unwrap().unwrap();
        store.start_execution(execution.id, Utc::now()).await.unwrap();
        store
            .finish_execution(FinishExecution {
                execution_id: execution.id,
                result: ExecutionResult::Passed,
                outputs: None,
                finished_at: Utc::now(),
                tags: BTreeMap::new(),
                completion: NewRawEvent {
                    source_id: stage.id,
                    source_name: "deploy".into(),
                    source_type: db::models::SourceType::Stage,
                    raw: b"{}".to_vec(),
                    headers: json!({}),
                },
            })
            .await
            .unwrap();

        let inputs = builder.build("gh", &HashMap::new(), Completeness::Required).await.unwrap();
        assert_eq!(Value::Object(inputs), json!({ "VERSION": "v7" }));
    }
}
