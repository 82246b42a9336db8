//! The event envelope and its JSON wire format.

use crate::payload::EventPayload;
use arbor_core::{ArborError, ArborResult, RunId};
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Every event type the engine publishes.
///
/// Wire names are PascalCase; the two model-call events keep the `LLM`
/// acronym in upper case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// A new node was created (root or subtask).
    TaskSubmitted,
    /// All dependencies of a node completed.
    TaskReady,
    /// A node was bound to a worker/action.
    TaskAssigned,
    /// Execution of a node began.
    TaskStarted,
    /// A node finished successfully.
    TaskCompleted,
    /// A node failed.
    TaskFailed,
    /// A node result is ready for downstream consumers.
    TaskResultAvailable,
    /// A node decided to decompose into subtasks.
    SubtasksPlanned,
    /// A child node was materialized in an inner graph.
    NodeAdded,
    /// A dependency edge was recorded.
    EdgeAdded,
    /// All children of a decomposition are materialized.
    InnerGraphBuilt,
    /// Audit record of a status transition.
    NodeStatusChanged,
    /// A language model call started.
    #[serde(rename = "LLMCallStarted")]
    LlmCallStarted,
    /// A language model call returned.
    #[serde(rename = "LLMCallCompleted")]
    LlmCallCompleted,
    /// An action invocation started.
    ToolInvoked,
    /// An action invocation returned.
    ToolReturned,
    /// A run started.
    RunStarted,
    /// A run ended (always the last event of a run).
    RunFinished,
    /// A run failed; followed by `RunFinished`.
    RunError,
}

impl EventType {
    /// All event types.
    pub const ALL: [EventType; 19] = [
        EventType::TaskSubmitted,
        EventType::TaskReady,
        EventType::TaskAssigned,
        EventType::TaskStarted,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::TaskResultAvailable,
        EventType::SubtasksPlanned,
        EventType::NodeAdded,
        EventType::EdgeAdded,
        EventType::InnerGraphBuilt,
        EventType::NodeStatusChanged,
        EventType::LlmCallStarted,
        EventType::LlmCallCompleted,
        EventType::ToolInvoked,
        EventType::ToolReturned,
        EventType::RunStarted,
        EventType::RunFinished,
        EventType::RunError,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TaskSubmitted => "TaskSubmitted",
            EventType::TaskReady => "TaskReady",
            EventType::TaskAssigned => "TaskAssigned",
            EventType::TaskStarted => "TaskStarted",
            EventType::TaskCompleted => "TaskCompleted",
            EventType::TaskFailed => "TaskFailed",
            EventType::TaskResultAvailable => "TaskResultAvailable",
            EventType::SubtasksPlanned => "SubtasksPlanned",
            EventType::NodeAdded => "NodeAdded",
            EventType::EdgeAdded => "EdgeAdded",
            EventType::InnerGraphBuilt => "InnerGraphBuilt",
            EventType::NodeStatusChanged => "NodeStatusChanged",
            EventType::LlmCallStarted => "LLMCallStarted",
            EventType::LlmCallCompleted => "LLMCallCompleted",
            EventType::ToolInvoked => "ToolInvoked",
            EventType::ToolReturned => "ToolReturned",
            EventType::RunStarted => "RunStarted",
            EventType::RunFinished => "RunFinished",
            EventType::RunError => "RunError",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of something that happened during a run.
///
/// The event type is derived from the payload variant, so the two can never
/// disagree. On the wire the envelope is
/// `{event_id, event_type, timestamp, source_service, run_id, payload}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireEvent")]
pub struct Event {
    /// Unique id (UUID v4).
    pub event_id: Uuid,
    /// UTC creation time.
    pub timestamp: DateTime<Utc>,
    /// Component that produced the event.
    pub source_service: String,
    /// Run the event belongs to.
    pub run_id: RunId,
    /// Typed payload.
    pub payload: EventPayload,
}

impl Event {
    /// Create an event stamped with a fresh id and the current time.
    pub fn new(
        source_service: impl Into<String>,
        run_id: RunId,
        payload: impl Into<EventPayload>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source_service: source_service.into(),
            run_id,
            payload: payload.into(),
        }
    }

    /// Event type, derived from the payload.
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Encode to the JSON wire format.
    pub fn to_json(&self) -> ArborResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire format.
    ///
    /// Unknown fields are ignored. A payload that does not match the declared
    /// `event_type` is rejected as a whole.
    pub fn from_json(json: &str) -> ArborResult<Self> {
        let wire: WireEvent = serde_json::from_str(json)?;
        Event::try_from(wire)
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Event", 6)?;
        state.serialize_field("event_id", &self.event_id)?;
        state.serialize_field("event_type", &self.event_type())?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("source_service", &self.source_service)?;
        state.serialize_field("run_id", &self.run_id)?;
        state.serialize_field("payload", &self.payload)?;
        state.end()
    }
}

/// The envelope with its payload still undecoded.
///
/// Subscribers read this first so they can filter on `event_type` before
/// paying for (or failing) the payload decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    /// Unique id.
    pub event_id: Uuid,
    /// Declared event type.
    pub event_type: EventType,
    /// UTC creation time.
    pub timestamp: DateTime<Utc>,
    /// Component that produced the event.
    pub source_service: String,
    /// Run the event belongs to.
    pub run_id: RunId,
    /// Raw payload.
    pub payload: serde_json::Value,
}

impl TryFrom<WireEvent> for Event {
    type Error = ArborError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let payload = EventPayload::decode(wire.event_type, wire.payload)?;
        Ok(Self {
            event_id: wire.event_id,
            timestamp: wire.timestamp,
            source_service: wire.source_service,
            run_id: wire.run_id,
            payload,
        })
    }
}
