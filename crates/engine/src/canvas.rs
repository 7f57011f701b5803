//! Canvas files: validation and apply.
//!
//! A canvas file names every node; connections refer to upstream nodes by
//! name and are resolved to ids on apply.
//!
//! Rules enforced by [`validate_canvas`]:
//! 1. Source, stage and secret names are unique within the canvas.
//! 2. Every connection names an existing source or stage of its type.
//! 3. Input mappings only reference declared inputs, existing
//!    connections and existing secrets, and cover every required input.
//! 4. Filter and tag expressions parse; time windows are well formed.
//! 5. Executor specs only reference declared inputs and secrets, and pass
//!    their adapter's validation.
//! 6. The stage-to-stage graph is acyclic.
//!
//! Returns stage names in topological order on success.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use bus::{Bus, Message};
use db::models::SourceType;
use db::{NewCanvas, NewEventSource, NewSecret, NewStage, Store};
use executors::ExecutorRegistry;

use crate::expr::Expression;
use crate::models::{
    Condition, Connection, Filter, FilterOperator, InputDefinition, InputMapping,
    OutputDefinition, SecretDefinition, StageDefinition, TagDefinition, ValueFrom,
};
use crate::secrets::{seal_source_key, seal_values, Encryptor, LOCAL_PROVIDER};
use crate::template;
use crate::workers::publish;
use crate::EngineError;

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasFile {
    pub name: String,
    pub organization_id: Uuid,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    /// HMAC signing key shared with the sender.
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub name: String,
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Name of the upstream source or stage.
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub filter_operator: FilterOperator,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub connections: Vec<ConnectionSpec>,
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

impl CanvasFile {
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(raw)?)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a canvas file and return its stages in dependency order.
pub fn validate_canvas(
    canvas: &CanvasFile,
    executors: &ExecutorRegistry,
) -> Result<Vec<String>, EngineError> {
    let mut names: HashSet<&str> = HashSet::new();
    for name in canvas.sources.iter().map(|s| &s.name).chain(canvas.stages.iter().map(|s| &s.name)) {
        if !names.insert(name.as_str()) {
            return Err(EngineError::DuplicateName(name.clone()));
        }
    }
    let mut secret_names: HashSet<&str> = HashSet::new();
    for secret in &canvas.secrets {
        if !secret_names.insert(secret.name.as_str()) {
            return Err(EngineError::DuplicateName(secret.name.clone()));
        }
    }

    let sources: HashSet<&str> = canvas.sources.iter().map(|s| s.name.as_str()).collect();
    let stages: HashSet<&str> = canvas.stages.iter().map(|s| s.name.as_str()).collect();
    let secrets: HashMap<&str, &SecretSpec> =
        canvas.secrets.iter().map(|s| (s.name.as_str(), s)).collect();

    for stage in &canvas.stages {
        StageCheck { stage, sources: &sources, stages: &stages, secrets: &secrets, executors }
            .run()?;
    }

    stage_order(canvas)
}

struct StageCheck<'a> {
    stage: &'a StageSpec,
    sources: &'a HashSet<&'a str>,
    stages: &'a HashSet<&'a str>,
    secrets: &'a HashMap<&'a str, &'a SecretSpec>,
    executors: &'a ExecutorRegistry,
}

impl StageCheck<'_> {
    fn run(&self) -> Result<(), EngineError> {
        self.connections()?;
        self.conditions()?;
        self.inputs()?;
        self.outputs()?;
        self.stage_secrets()?;
        self.executor_spec()
    }

    fn invalid(&self, message: impl Into<String>) -> EngineError {
        EngineError::InvalidStage { stage: self.stage.name.clone(), message: message.into() }
    }

    fn unknown_connection(&self, connection: &str) -> EngineError {
        EngineError::UnknownConnection {
            stage: self.stage.name.clone(),
            connection: connection.to_string(),
        }
    }

    fn parse(&self, expression: &str) -> Result<(), EngineError> {
        Expression::parse(expression)
            .map(|_| ())
            .map_err(|e| self.invalid(format!("expression '{expression}': {e}")))
    }

    fn connections(&self) -> Result<(), EngineError> {
        if self.stage.connections.is_empty() {
            return Err(self.invalid("at least one connection is required"));
        }
        let mut seen = HashSet::new();
        for connection in &self.stage.connections {
            if !seen.insert(connection.name.as_str()) {
                return Err(self.invalid(format!("duplicate connection '{}'", connection.name)));
            }
            let known = match connection.source_type {
                SourceType::EventSource => self.sources.contains(connection.name.as_str()),
                SourceType::Stage => self.stages.contains(connection.name.as_str()),
            };
            if !known {
                return Err(self.unknown_connection(&connection.name));
            }
            if connection.source_type == SourceType::Stage && connection.name == self.stage.name {
                return Err(self.invalid("a stage cannot connect to itself"));
            }
            for filter in &connection.filters {
                self.parse(filter.expression())?;
            }
        }
        for tag in &self.stage.tags {
            self.parse(&tag.value_from)?;
        }
        Ok(())
    }

    fn conditions(&self) -> Result<(), EngineError> {
        for condition in &self.stage.conditions {
            match condition {
                Condition::Approval { count } if *count == 0 => {
                    return Err(self.invalid("approval count must be at least 1"));
                }
                Condition::Approval { .. } => {}
                Condition::TimeWindow(window) => {
                    window.validate().map_err(|e| self.invalid(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    fn has_connection(&self, name: &str) -> bool {
        self.stage.connections.iter().any(|c| c.name == name)
    }

    fn inputs(&self) -> Result<(), EngineError> {
        let mut declared = HashSet::new();
        for input in &self.stage.inputs {
            if !declared.insert(input.name.as_str()) {
                return Err(self.invalid(format!("duplicate input '{}'", input.name)));
            }
        }
        if declared.is_empty() {
            return Ok(());
        }

        let mut unguarded = 0;
        for mapping in &self.stage.input_mappings {
            match mapping.when.as_ref().and_then(|w| w.triggered_by.as_ref()) {
                Some(triggered_by) if !self.has_connection(&triggered_by.connection) => {
                    return Err(self.unknown_connection(&triggered_by.connection));
                }
                Some(_) => {}
                None => unguarded += 1,
            }
            self.mapping_values(mapping, &declared)?;
        }
        if unguarded > 1 {
            return Err(self.invalid("only one input mapping may omit 'when'"));
        }

        // Every connection that can trigger the stage needs a mapping.
        for connection in &self.stage.connections {
            if !self.stage.input_mappings.iter().any(|m| m.applies_to(&connection.name)) {
                return Err(self.invalid(format!("no input mapping for connection '{}'", connection.name)));
            }
        }
        Ok(())
    }

    fn mapping_values(
        &self,
        mapping: &InputMapping,
        declared: &HashSet<&str>,
    ) -> Result<(), EngineError> {
        for value in &mapping.values {
            if !declared.contains(value.name.as_str()) {
                return Err(self.invalid(format!("mapping for undeclared input '{}'", value.name)));
            }
            match (&value.value, &value.value_from) {
                (Some(_), None) => {}
                (None, Some(ValueFrom::EventData(reference))) => {
                    if !self.has_connection(&reference.connection) {
                        return Err(self.unknown_connection(&reference.connection));
                    }
                    self.parse(&reference.expression)?;
                }
                (None, Some(ValueFrom::LastExecution(reference))) => {
                    if reference.results.is_empty() {
                        return Err(self.invalid(format!("input '{}': no results given", value.name)));
                    }
                }
                (None, Some(ValueFrom::Secret(reference))) => {
                    self.secret_key(&reference.name, &reference.key)?;
                }
                _ => {
                    return Err(self.invalid(format!(
                        "input '{}' needs exactly one of value or value_from",
                        value.name
                    )));
                }
            }
        }

        for input in self.stage.inputs.iter().filter(|i| i.required) {
            if !mapping.values.iter().any(|v| v.name == input.name) {
                return Err(self.invalid(format!("required input '{}' is not mapped", input.name)));
            }
        }
        Ok(())
    }

    fn outputs(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for output in &self.stage.outputs {
            if !seen.insert(output.name.as_str()) {
                return Err(self.invalid(format!("duplicate output '{}'", output.name)));
            }
        }
        Ok(())
    }

    fn secret_key(&self, name: &str, key: &str) -> Result<(), EngineError> {
        let secret = self
            .secrets
            .get(name)
            .ok_or_else(|| self.invalid(format!("unknown secret '{name}'")))?;
        if !secret.values.contains_key(key) {
            return Err(self.invalid(format!("secret '{name}' has no key '{key}'")));
        }
        Ok(())
    }

    fn stage_secrets(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for definition in &self.stage.secrets {
            if !seen.insert(definition.name.as_str()) {
                return Err(self.invalid(format!("duplicate secret '{}'", definition.name)));
            }
            let reference = &definition.value_from.secret;
            self.secret_key(&reference.name, &reference.key)?;
        }
        Ok(())
    }

    fn executor_spec(&self) -> Result<(), EngineError> {
        let spec = &self.stage.executor_spec;
        let references = template::references(spec).map_err(|e| self.invalid(e.to_string()))?;
        for (kind, name) in &references {
            let known = match kind.as_str() {
                "inputs" => self.stage.inputs.iter().any(|i| &i.name == name),
                _ => self.stage.secrets.iter().any(|s| &s.name == name),
            };
            if !known {
                return Err(self.invalid(format!("executor spec references unknown {kind}.{name}")));
            }
        }

        // Templated specs are only fully checked once rendered at dispatch.
        let checked = if references.is_empty() {
            self.executors.validate(spec)
        } else {
            self.executors.for_spec(spec).map(|_| ())
        };
        checked.map_err(|e| self.invalid(e.to_string()))
    }
}

/// Kahn's algorithm over stage-to-stage connections. Stages without
/// upstream stages come first, in declaration order.
fn stage_order(canvas: &CanvasFile) -> Result<Vec<String>, EngineError> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for stage in &canvas.stages {
        adjacency.entry(stage.name.as_str()).or_default();
        in_degree.entry(stage.name.as_str()).or_insert(0);
    }
    for stage in &canvas.stages {
        for connection in stage.connections.iter().filter(|c| c.source_type == SourceType::Stage) {
            adjacency.entry(connection.name.as_str()).or_default().push(stage.name.as_str());
            *in_degree.entry(stage.name.as_str()).or_insert(0) += 1;
        }
    }

    let mut queue: VecDeque<&str> = canvas
        .stages
        .iter()
        .map(|s| s.name.as_str())
        .filter(|name| in_degree.get(name) == Some(&0))
        .collect();

    let mut sorted = Vec::with_capacity(canvas.stages.len());
    while let Some(name) = queue.pop_front() {
        sorted.push(name.to_string());
        for &downstream in adjacency.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(downstream) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(downstream);
                }
            }
        }
    }

    if sorted.len() != canvas.stages.len() {
        return Err(EngineError::CycleDetected);
    }
    Ok(sorted)
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Ids of everything [`apply_canvas`] created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCanvas {
    pub canvas_id: Uuid,
    pub sources: BTreeMap<String, Uuid>,
    pub stages: BTreeMap<String, Uuid>,
}

/// Validate, then create the canvas with its sources, secrets and stages.
/// Stages are created upstream first so connections can carry ids.
pub async fn apply_canvas(
    store: &dyn Store,
    bus: &dyn Bus,
    encryptor: &dyn Encryptor,
    executors: &ExecutorRegistry,
    file: &CanvasFile,
) -> Result<AppliedCanvas, EngineError> {
    let order = validate_canvas(file, executors)?;

    let canvas = store
        .create_canvas(NewCanvas { organization_id: file.organization_id, name: file.name.clone() })
        .await?;
    let mut applied = AppliedCanvas {
        canvas_id: canvas.id,
        sources: BTreeMap::new(),
        stages: BTreeMap::new(),
    };

    for source in &file.sources {
        let key = seal_source_key(encryptor, &source.name, &source.key)?;
        let row = store
            .create_event_source(NewEventSource { canvas_id: canvas.id, name: source.name.clone(), key })
            .await?;
        info!(canvas_id = %canvas.id, source_id = %row.id, name = %row.name, "event source created");
        publish(
            bus,
            Message::EventSourceCreated { canvas_id: canvas.id, source_id: row.id, timestamp: Utc::now() },
        )
        .await;
        applied.sources.insert(row.name, row.id);
    }

    for secret in &file.secrets {
        store
            .create_secret(NewSecret {
                canvas_id: canvas.id,
                name: secret.name.clone(),
                provider: LOCAL_PROVIDER.to_string(),
                data: seal_values(encryptor, &secret.name, &secret.values)?,
            })
            .await?;
    }

    let specs: HashMap<&str, &StageSpec> = file.stages.iter().map(|s| (s.name.as_str(), s)).collect();
    for name in &order {
        let Some(spec) = specs.get(name.as_str()) else { continue };
        let definition = resolve_connections(spec, &applied)?;
        let row = store.create_stage(new_stage(canvas.id, &definition)?).await?;
        info!(canvas_id = %canvas.id, stage_id = %row.id, name = %row.name, "stage created");
        publish(
            bus,
            Message::StageCreated { canvas_id: canvas.id, stage_id: row.id, timestamp: Utc::now() },
        )
        .await;
        applied.stages.insert(row.name, row.id);
    }

    Ok(applied)
}

fn resolve_connections(spec: &StageSpec, applied: &AppliedCanvas) -> Result<StageDefinition, EngineError> {
    let connections = spec
        .connections
        .iter()
        .map(|c| {
            let ids = match c.source_type {
                SourceType::EventSource => &applied.sources,
                SourceType::Stage => &applied.stages,
            };
            let source_id = ids.get(&c.name).copied().ok_or_else(|| EngineError::UnknownConnection {
                stage: spec.name.clone(),
                connection: c.name.clone(),
            })?;
            Ok(Connection {
                name: c.name.clone(),
                source_id,
                source_type: c.source_type,
                filter_operator: c.filter_operator,
                filters: c.filters.clone(),
            })
        })
        .collect::<Result<Vec<_>, EngineError>>()?;

    Ok(StageDefinition {
        name: spec.name.clone(),
        conditions: spec.conditions.clone(),
        connections,
        inputs: spec.inputs.clone(),
        input_mappings: spec.input_mappings.clone(),
        outputs: spec.outputs.clone(),
        secrets: spec.secrets.clone(),
        tags: spec.tags.clone(),
        executor_spec: spec.executor_spec.clone(),
    })
}

/// The row for a stage definition, one JSON column per part.
pub fn new_stage(canvas_id: Uuid, definition: &StageDefinition) -> Result<NewStage, EngineError> {
    Ok(NewStage {
        canvas_id,
        name: definition.name.clone(),
        conditions: serde_json::to_value(&definition.conditions)?,
        connections: serde_json::to_value(&definition.connections)?,
        inputs: serde_json::to_value(&definition.inputs)?,
        input_mappings: serde_json::to_value(&definition.input_mappings)?,
        outputs: serde_json::to_value(&definition.outputs)?,
        secrets: serde_json::to_value(&definition.secrets)?,
        tags: serde_json::to_value(&definition.tags)?,
        executor_spec: definition.executor_spec.clone(),
    })
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bus::{MemoryBus, RoutingKey};
    use db::MemoryStore;
    use serde_json::json;

    use crate::secrets::NoOpEncryptor;

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::with_builtin(Duration::from_secs(1)).unwrap()
    }

    fn http() -> Value {
        json!({ "type": "http", "url": "https://deploy.example.com/hooks" })
    }

    fn stage(name: &str, upstream: &[(&str, &str)]) -> Value {
        let connections: Vec<Value> = upstream
            .iter()
            .map(|(name, kind)| json!({ "name": name, "type": kind }))
            .collect();
        json!({ "name": name, "connections": connections, "executor_spec": http() })
    }

    fn canvas(stages: Vec<Value>) -> CanvasFile {
        serde_json::from_value(json!({
            "name": "delivery",
            "organization_id": Uuid::new_v4(),
            "sources": [{ "name": "github", "key": "k3y" }],
            "secrets": [{ "name": "creds", "values": { "token": "s3cr3t" } }],
            "stages": stages,
        }))
        .unwrap()
    }

    fn invalid_message(err: EngineError) -> String {
        match err {
            EngineError::InvalidStage { message, .. } => message,
            other => panic!("expected InvalidStage, got {other:?}"),
        }
    }

    #[test]
    fn linear_chain_is_ordered_upstream_first() {
        let file = canvas(vec![
            stage("prod", &[("staging", "stage")]),
            stage("staging", &[("build", "stage")]),
            stage("build", &[("github", "event_source")]),
        ]);
        assert_eq!(validate_canvas(&file, &registry()).unwrap(), ["build", "staging", "prod"]);
    }

    #[test]
    fn diamond_puts_fan_in_stage_last() {
        let file = canvas(vec![
            stage("build", &[("github", "event_source")]),
            stage("unit", &[("build", "stage")]),
            stage("lint", &[("build", "stage")]),
            stage("release", &[("unit", "stage"), ("lint", "stage")]),
        ]);
        let order = validate_canvas(&file, &registry()).unwrap();
        assert_eq!(order.first().map(String::as_str), Some("build"));
        assert_eq!(order.last().map(String::as_str), Some("release"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let file = canvas(vec![
            stage("build", &[("github", "event_source")]),
            stage("build", &[("github", "event_source")]),
        ]);
        assert!(matches!(
            validate_canvas(&file, &registry()),
            Err(EngineError::DuplicateName(name)) if name == "build"
        ));
    }

    #[test]
    fn stage_named_like_a_source_is_rejected() {
        let file = canvas(vec![stage("github", &[("github", "event_source")])]);
        assert!(matches!(validate_canvas(&file, &registry()), Err(EngineError::DuplicateName(_))));
    }

    #[test]
    fn unknown_connection_is_rejected() {
        let file = canvas(vec![stage("build", &[("gitlab", "event_source")])]);
        assert!(matches!(
            validate_canvas(&file, &registry()),
            Err(EngineError::UnknownConnection { connection, .. }) if connection == "gitlab"
        ));
    }

    #[test]
    fn connection_type_must_match_the_node() {
        // "github" exists, but as a source rather than a stage.
        let file = canvas(vec![stage("build", &[("github", "stage")])]);
        assert!(matches!(
            validate_canvas(&file, &registry()),
            Err(EngineError::UnknownConnection { .. })
        ));
    }

    #[test]
    fn cycle_is_detected() {
        let file = canvas(vec![
            stage("a", &[("github", "event_source"), ("c", "stage")]),
            stage("b", &[("a", "stage")]),
            stage("c", &[("b", "stage")]),
        ]);
        assert!(matches!(validate_canvas(&file, &registry()), Err(EngineError::CycleDetected)));
    }

    #[test]
    fn self_connection_is_rejected() {
        let file = canvas(vec![stage("a", &[("github", "event_source"), ("a", "stage")])]);
        assert!(invalid_message(validate_canvas(&file, &registry()).unwrap_err())
            .contains("itself"));
    }

    #[test]
    fn single_stage_canvas_is_valid() {
        let file = canvas(vec![stage("build", &[("github", "event_source")])]);
        assert_eq!(validate_canvas(&file, &registry()).unwrap(), ["build"]);
    }

    #[test]
    fn unparsable_filter_is_rejected() {
        let mut build = stage("build", &[]);
        build["connections"] = json!([{
            "name": "github",
            "type": "event_source",
            "filters": [{ "type": "data", "expression": "ref == " }],
        }]);
        let err = validate_canvas(&canvas(vec![build]), &registry()).unwrap_err();
        assert!(invalid_message(err).contains("ref =="));
    }

    #[test]
    fn zero_approvals_are_rejected() {
        let mut build = stage("build", &[("github", "event_source")]);
        build["conditions"] = json!([{ "type": "approval", "count": 0 }]);
        let err = validate_canvas(&canvas(vec![build]), &registry()).unwrap_err();
        assert!(invalid_message(err).contains("approval count"));
    }

    #[test]
    fn malformed_time_window_is_rejected() {
        let mut build = stage("build", &[("github", "event_source")]);
        build["conditions"] = json!([{
            "type": "time_window", "start": "25:00", "end": "18:00", "week_days": ["monday"],
        }]);
        assert!(validate_canvas(&canvas(vec![build]), &registry()).is_err());
    }

    #[test]
    fn required_input_must_be_mapped() {
        let mut build = stage("build", &[("github", "event_source")]);
        build["inputs"] = json!([{ "name": "VERSION" }, { "name": "NOTES", "required": false }]);
        build["input_mappings"] = json!([{ "values": [{ "name": "NOTES", "value": "none" }] }]);
        let err = validate_canvas(&canvas(vec![build]), &registry()).unwrap_err();
        assert!(invalid_message(err).contains("VERSION"));
    }

    #[test]
    fn mapping_value_needs_exactly_one_source() {
        let mut build = stage("build", &[("github", "event_source")]);
        build["inputs"] = json!([{ "name": "VERSION" }]);
        build["input_mappings"] = json!([{ "values": [{
            "name": "VERSION",
            "value": "v1",
            "value_from": { "event_data": { "connection": "github", "expression": "ref" } },
        }] }]);
        let err = validate_canvas(&canvas(vec![build]), &registry()).unwrap_err();
        assert!(invalid_message(err).contains("exactly one"));
    }

    #[test]
    fn each_connection_needs_an_applicable_mapping() {
        let mut release = stage("release", &[("github", "event_source"), ("build", "stage")]);
        release["inputs"] = json!([{ "name": "VERSION" }]);
        release["input_mappings"] = json!([{
            "when": { "triggered_by": { "connection": "github" } },
            "values": [{ "name": "VERSION", "value": "v1" }],
        }]);
        let file = canvas(vec![stage("build", &[("github", "event_source")]), release]);
        let err = validate_canvas(&file, &registry()).unwrap_err();
        assert!(invalid_message(err).contains("'build'"));
    }

    #[test]
    fn secret_references_must_exist() {
        let mut build = stage("build", &[("github", "event_source")]);
        build["secrets"] = json!([{
            "name": "TOKEN",
            "value_from": { "secret": { "name": "creds", "key": "password" } },
        }]);
        let err = validate_canvas(&canvas(vec![build]), &registry()).unwrap_err();
        assert!(invalid_message(err).contains("password"));
    }

    #[test]
    fn executor_spec_may_only_reference_declared_names() {
        let mut build = stage("build", &[("github", "event_source")]);
        build["executor_spec"] = json!({
            "type": "http",
            "url": "https://deploy.example.com/${{ inputs.TARGET }}",
        });
        let err = validate_canvas(&canvas(vec![build]), &registry()).unwrap_err();
        assert!(invalid_message(err).contains("inputs.TARGET"));
    }

    #[test]
    fn unknown_executor_type_is_rejected() {
        let mut build = stage("build", &[("github", "event_source")]);
        build["executor_spec"] = json!({ "type": "ftp" });
        assert!(validate_canvas(&canvas(vec![build]), &registry()).is_err());
    }

    #[tokio::test]
    async fn apply_creates_nodes_with_resolved_connections() {
        let store = MemoryStore::new();
        let bus = MemoryBus::new();
        let file = canvas(vec![
            stage("deploy", &[("build", "stage")]),
            stage("build", &[("github", "event_source")]),
        ]);

        let applied = apply_canvas(&store, &bus, &NoOpEncryptor, &registry(), &file).await.unwrap();

        let build_id = applied.stages["build"];
        let deploy = store.find_stage(applied.stages["deploy"]).await.unwrap();
        assert_eq!(deploy.connections[0]["source_id"], json!(build_id));
        assert!(deploy.is_connected_to(build_id, SourceType::Stage));

        let source = store.find_event_source(applied.sources["github"]).await.unwrap();
        assert_eq!(source.key, b"k3y");
        let secret = store.find_secret_by_name(applied.canvas_id, "creds").await.unwrap();
        assert_eq!(secret.provider, LOCAL_PROVIDER);

        assert_eq!(bus.published_with(RoutingKey::StageCreated).len(), 2);
        assert_eq!(bus.published_with(RoutingKey::EventSourceCreated).len(), 1);
    }

    #[tokio::test]
    async fn invalid_canvas_writes_nothing() {
        let store = MemoryStore::new();
        let bus = MemoryBus::new();
        let file = canvas(vec![stage("build", &[("gitlab", "event_source")])]);

        assert!(apply_canvas(&store, &bus, &NoOpEncryptor, &registry(), &file).await.is_err());
        assert!(bus.published().is_empty());
    }
}
