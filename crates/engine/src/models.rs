//! Core domain models for the stage progression engine.
//!
//! A [`Stage`] is decoded from the JSON columns of a `db::models::StageRow`.
//! These types are the source of truth for what a stage definition looks
//! like in memory; the same shapes are accepted by canvas files.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use db::models::{ExecutionResult, SourceType, StageExecutionRow, StageRow};

use crate::timewindow::TimeWindow;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A gate evaluated before a stage-event may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// At least `count` distinct requesters must approve.
    Approval { count: u32 },
    /// `now` must fall inside the window.
    TimeWindow(TimeWindow),
}

// ---------------------------------------------------------------------------
// Connections and filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// Expression over the event's JSON payload.
    Data { expression: String },
    /// Expression over the event's headers.
    Header { expression: String },
}

/// A typed edge from an event source or a stage into a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Name of the upstream node.
    pub name: String,
    pub source_id: Uuid,
    pub source_type: SourceType,
    #[serde(default)]
    pub filter_operator: FilterOperator,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl Connection {
    pub fn matches(&self, source_id: Uuid, source_type: SourceType) -> bool {
        self.source_id == source_id && self.source_type == source_type
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<When>,
    pub values: Vec<ValueDefinition>,
}

impl InputMapping {
    /// Whether this mapping applies to an event that arrived via `connection`.
    pub fn applies_to(&self, connection: &str) -> bool {
        match self.when.as_ref().and_then(|w| w.triggered_by.as_ref()) {
            Some(triggered_by) => triggered_by.connection == connection,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct When {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<TriggeredBy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredBy {
    pub connection: String,
}

/// One input value: either a literal or a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFrom {
    EventData(EventDataRef),
    LastExecution(LastExecutionRef),
    Secret(SecretKeyRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDataRef {
    pub connection: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastExecutionRef {
    pub results: Vec<ExecutionResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

// ---------------------------------------------------------------------------
// Outputs, secrets, tags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// A secret the executor spec may reference as `${{ secrets.NAME }}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDefinition {
    pub name: String,
    pub value_from: SecretValueFrom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretValueFrom {
    pub secret: SecretKeyRef,
}

/// A tag computed from the triggering event's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub name: String,
    pub value_from: String,
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A stage definition as stored in the JSON columns of `stages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub inputs: Vec<InputDefinition>,
    #[serde(default)]
    pub input_mappings: Vec<InputMapping>,
    #[serde(default)]
    pub outputs: Vec<OutputDefinition>,
    #[serde(default)]
    pub secrets: Vec<SecretDefinition>,
    #[serde(default)]
    pub tags: Vec<TagDefinition>,
    pub executor_spec: Value,
}

/// A persisted stage with its definition decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub definition: StageDefinition,
}

impl std::ops::Deref for Stage {
    type Target = StageDefinition;

    fn deref(&self) -> &StageDefinition {
        &self.definition
    }
}

impl TryFrom<&StageRow> for Stage {
    type Error = EngineError;

    fn try_from(row: &StageRow) -> Result<Self, Self::Error> {
        fn column<T: serde::de::DeserializeOwned>(
            row: &StageRow,
            name: &str,
            value: &Value,
        ) -> Result<T, EngineError> {
            // Columns written before a field existed may hold null.
            let value = if value.is_null() { Value::Array(Vec::new()) } else { value.clone() };
            serde_json::from_value(value).map_err(|e| EngineError::InvalidStage {
                stage: row.name.clone(),
                message: format!("{name}: {e}"),
            })
        }

        Ok(Self {
            id: row.id,
            canvas_id: row.canvas_id,
            definition: StageDefinition {
                name: row.name.clone(),
                conditions: column(row, "conditions", &row.conditions)?,
                connections: column(row, "connections", &row.connections)?,
                inputs: column(row, "inputs", &row.inputs)?,
                input_mappings: column(row, "input_mappings", &row.input_mappings)?,
                outputs: column(row, "outputs", &row.outputs)?,
                secrets: column(row, "secrets", &row.secrets)?,
                tags: column(row, "tags", &row.tags)?,
                executor_spec: row.executor_spec.clone(),
            },
        })
    }
}

impl StageDefinition {
    /// Required approvals, if the stage has an approval gate.
    pub fn approval_count(&self) -> Option<u32> {
        self.conditions.iter().find_map(|c| match c {
            Condition::Approval { count } => Some(*count),
            Condition::TimeWindow(_) => None,
        })
    }

    pub fn time_windows(&self) -> impl Iterator<Item = &TimeWindow> {
        self.conditions.iter().filter_map(|c| match c {
            Condition::TimeWindow(window) => Some(window),
            Condition::Approval { .. } => None,
        })
    }

    pub fn connection_named(&self, name: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.name == name)
    }

    /// The connections an event from this source arrived through.
    pub fn connections_from(
        &self,
        source_id: Uuid,
        source_type: SourceType,
    ) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(move |c| c.matches(source_id, source_type))
    }

    /// Connections referenced by `event_data` values. More than one makes
    /// this a fan-in stage whose events wait for every upstream.
    pub fn event_data_connections(&self) -> BTreeSet<&str> {
        self.input_mappings
            .iter()
            .flat_map(|m| m.values.iter())
            .filter_map(|v| match &v.value_from {
                Some(ValueFrom::EventData(r)) => Some(r.connection.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_fan_in(&self) -> bool {
        self.event_data_connections().len() > 1
    }

    pub fn input(&self, name: &str) -> Option<&InputDefinition> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn secret_named(&self, name: &str) -> Option<&SecretDefinition> {
        self.secrets.iter().find(|s| s.name == name)
    }

    /// Names of required outputs missing from `outputs`.
    pub fn missing_required_outputs(&self, outputs: &Value) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|o| o.required && outputs.get(&o.name).map_or(true, Value::is_null))
            .map(|o| o.name.clone())
            .collect()
    }

    /// Keep only the declared outputs.
    pub fn declared_outputs(&self, outputs: &Map<String, Value>) -> Map<String, Value> {
        outputs
            .iter()
            .filter(|(name, _)| self.outputs.iter().any(|o| &o.name == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Completion event
// ---------------------------------------------------------------------------

/// Body of the raw event a finished execution re-enters the router with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub stage: CompletionStage,
    pub execution: CompletionExecution,
    pub outputs: Value,
    pub tags: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStage {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionExecution {
    pub id: Uuid,
    pub result: ExecutionResult,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl CompletionEvent {
    pub const KIND: &'static str = "StageExecutionCompletion";

    pub fn new(
        stage: &Stage,
        execution: &StageExecutionRow,
        result: ExecutionResult,
        finished_at: DateTime<Utc>,
        outputs: Value,
        tags: Value,
    ) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            stage: CompletionStage { id: stage.id, name: stage.name.clone() },
            execution: CompletionExecution {
                id: execution.id,
                result,
                created_at: execution.created_at,
                started_at: execution.started_at,
                finished_at,
            },
            outputs,
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(connections: Value, input_mappings: Value) -> StageRow {
        StageRow {
            id: Uuid::new_v4(),
            canvas_id: Uuid::new_v4(),
            name: "deploy".into(),
            conditions: json!([
                { "type": "approval", "count": 2 },
                { "type": "time_window", "start": "08:00", "end": "17:00", "week_days": ["Monday"] }
            ]),
            connections,
            inputs: json!([{ "name": "VERSION" }]),
            input_mappings,
            outputs: json!([{ "name": "IMAGE", "required": true }, { "name": "LOG" }]),
            secrets: json!([]),
            tags: Value::Null,
            executor_spec: json!({ "type": "http", "url": "http://localhost" }),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn decodes_stage_row_columns() {
        let source = Uuid::new_v4();
        let stage = Stage::try_from(&row(
            json!([{ "name": "gh", "source_id": source, "source_type": "event_source",
                     "filters": [{ "type": "data", "expression": "ref == 'v1'" }] }]),
            json!([{ "values": [{ "name": "VERSION", "value_from": { "event_data": { "connection": "gh", "expression": "ref" } } }] }]),
        ))
        .unwrap();

        assert_eq!(stage.approval_count(), Some(2));
        assert_eq!(stage.time_windows().count(), 1);
        assert_eq!(stage.connections[0].filter_operator, FilterOperator::And);
        assert!(stage.inputs[0].required);
        assert!(stage.tags.is_empty());
        assert_eq!(stage.connections_from(source, SourceType::EventSource).count(), 1);
        assert!(!stage.is_fan_in());
    }

    #[test]
    fn malformed_columns_name_the_stage() {
        let err = Stage::try_from(&row(json!([{ "name": "gh" }]), json!([]))).unwrap_err();
        assert!(matches!(err, EngineError::InvalidStage { ref stage, .. } if stage == "deploy"));
    }

    #[test]
    fn required_outputs_and_declared_filter() {
        let stage = Stage::try_from(&row(json!([]), json!([]))).unwrap();
        assert_eq!(stage.missing_required_outputs(&json!({ "LOG": "x" })), vec!["IMAGE"]);
        assert!(stage.missing_required_outputs(&json!({ "IMAGE": "img:1" })).is_empty());

        let pushed = json!({ "IMAGE": "img:1", "OTHER": 1 });
        let kept = stage.declared_outputs(pushed.as_object().unwrap());
        assert_eq!(Value::Object(kept), json!({ "IMAGE": "img:1" }));
    }

    #[test]
    fn mapping_guard_matches_connection() {
        let guarded: InputMapping = serde_json::from_value(json!({
            "when": { "triggered_by": { "connection": "gh" } },
            "values": []
        }))
        .unwrap();
        assert!(guarded.applies_to("gh"));
        assert!(!guarded.applies_to("ci"));
        assert!(InputMapping::default().applies_to("ci"));
    }
}
