//! Messages carried by the bus, one variant per routing key.
//!
//! Payloads only carry identifiers and a timestamp; consumers re-read the
//! entity from the store before acting on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routing keys of the single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingKey {
    StageEventCreated,
    StageEventApproved,
    ExecutionCreated,
    ExecutionStarted,
    ExecutionFinished,
    StageCreated,
    EventSourceCreated,
}

impl RoutingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageEventCreated => "stage-event-created",
            Self::StageEventApproved => "stage-event-approved",
            Self::ExecutionCreated => "execution-created",
            Self::ExecutionStarted => "execution-started",
            Self::ExecutionFinished => "execution-finished",
            Self::StageCreated => "stage-created",
            Self::EventSourceCreated => "event-source-created",
        }
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "routing_key", rename_all = "kebab-case")]
pub enum Message {
    StageEventCreated {
        canvas_id: Uuid,
        stage_id: Uuid,
        stage_event_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    StageEventApproved {
        canvas_id: Uuid,
        stage_id: Uuid,
        stage_event_id: Uuid,
        requester_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ExecutionCreated {
        canvas_id: Uuid,
        stage_id: Uuid,
        stage_event_id: Uuid,
        execution_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ExecutionStarted {
        canvas_id: Uuid,
        stage_id: Uuid,
        execution_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ExecutionFinished {
        canvas_id: Uuid,
        stage_id: Uuid,
        execution_id: Uuid,
        result: String,
        timestamp: DateTime<Utc>,
    },
    StageCreated {
        canvas_id: Uuid,
        stage_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    EventSourceCreated {
        canvas_id: Uuid,
        source_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl Message {
    pub fn routing_key(&self) -> RoutingKey {
        match self {
            Self::StageEventCreated { .. } => RoutingKey::StageEventCreated,
            Self::StageEventApproved { .. } => RoutingKey::StageEventApproved,
            Self::ExecutionCreated { .. } => RoutingKey::ExecutionCreated,
            Self::ExecutionStarted { .. } => RoutingKey::ExecutionStarted,
            Self::ExecutionFinished { .. } => RoutingKey::ExecutionFinished,
            Self::StageCreated { .. } => RoutingKey::StageCreated,
            Self::EventSourceCreated { .. } => RoutingKey::EventSourceCreated,
        }
    }
}
