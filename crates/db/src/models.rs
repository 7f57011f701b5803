//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour.
//! Domain types (stage definitions, conditions, filters) live in the
//! `engine` crate and are decoded from the JSON columns of [`StageRow`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Declares a state enum stored as text, with `as_str`, `Display` and
/// `FromStr` kept in one place.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

text_enum!(
    /// What kind of node emitted a raw event.
    SourceType {
        EventSource => "event_source",
        Stage => "stage",
    }
);

text_enum!(
    /// Raw event lifecycle. Only ever moves forward from `Pending`.
    RawEventState {
        Pending => "pending",
        Processed => "processed",
        Discarded => "discarded",
    }
);

text_enum!(
    StageEventState {
        Pending => "pending",
        Waiting => "waiting",
        Processed => "processed",
    }
);

text_enum!(
    /// Second axis of the stage-event state space.
    StageEventStateReason {
        Approval => "approval",
        TimeWindow => "time_window",
        Execution => "execution",
        Connection => "connection",
        Cancelled => "cancelled",
    }
);

text_enum!(
    ExecutionState {
        Pending => "pending",
        Started => "started",
        Finished => "finished",
    }
);

text_enum!(
    ExecutionResult {
        Passed => "passed",
        Failed => "failed",
    }
);

text_enum!(
    /// Health of a stage-event tag; flips when the execution finishes.
    TagState {
        Unknown => "unknown",
        Healthy => "healthy",
        Unhealthy => "unhealthy",
    }
);

impl From<ExecutionResult> for TagState {
    fn from(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Passed => Self::Healthy,
            ExecutionResult::Failed => Self::Unhealthy,
        }
    }
}

/// A stage-event position in the `state × reason` matrix.
pub type StageEventStatus = (StageEventState, Option<StageEventStateReason>);

// ---------------------------------------------------------------------------
// canvases, event_sources, secrets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CanvasRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An event source. `key` is the encrypted HMAC signing key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventSourceRow {
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub name: String,
    pub key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// A provider-tagged secret blob. For the `local` provider `data` is an
/// encrypted JSON object of string values.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SecretRow {
    pub id: Uuid,
    pub canvas_id: Uuid,
    pub name: String,
    pub provider: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// stages
// ---------------------------------------------------------------------------

/// A persisted stage. Every structured part of the definition is kept in
/// its own JSONB column.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StageRow {
    pub id: Uuid,
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
    pub created_at: DateTime<Utc>,
}

impl StageRow {
    /// Whether one of this stage's connections points at the given source.
    pub fn is_connected_to(&self, source_id: Uuid, source_type: SourceType) -> bool {
        let source_id = source_id.to_string();
        self.connections
            .as_array()
            .map(|connections| {
                connections.iter().any(|c| {
                    c.get("source_id").and_then(Value::as_str) == Some(source_id.as_str())
                        && c.get("source_type").and_then(Value::as_str)
                            == Some(source_type.as_str())
                })
            })
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// raw events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEventRow {
    pub id: Uuid,
    pub source_id: Uuid,
    pub source_name: String,
    pub source_type: SourceType,
    /// Payload bytes exactly as received.
    pub raw: Vec<u8>,
    pub headers: Value,
    pub state: RawEventState,
    pub received_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// stage events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEventRow {
    pub id: Uuid,
    pub stage_id: Uuid,
    pub source_id: Uuid,
    pub source_name: String,
    pub source_type: SourceType,
    pub raw_event_id: Uuid,
    /// Written once at creation.
    pub inputs: Value,
    pub state: StageEventState,
    pub state_reason: Option<StageEventStateReason>,
    pub created_at: DateTime<Utc>,
}

impl StageEventRow {
    pub fn status(&self) -> StageEventStatus {
        (self.state, self.state_reason)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEventTagRow {
    pub stage_event_id: Uuid,
    pub name: String,
    pub value: String,
    pub state: TagState,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApprovalRow {
    pub id: Uuid,
    pub stage_event_id: Uuid,
    pub requester_id: Uuid,
    pub approved_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// stage executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecutionRow {
    pub id: Uuid,
    pub stage_id: Uuid,
    pub stage_event_id: Uuid,
    pub state: ExecutionState,
    pub result: Option<ExecutionResult>,
    /// Opaque handle recorded for asynchronous executors.
    pub reference_id: Option<String>,
    pub outputs: Value,
    pub tags: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
