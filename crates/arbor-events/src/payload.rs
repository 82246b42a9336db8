//! Typed payloads, one struct per [`EventType`].
//!
//! Payload structs tolerate unknown fields. Optional fields are marked with
//! `#[serde(default)]`; everything else is required and its absence fails the
//! decode.

use crate::event::EventType;
use arbor_core::{
    ActionStatus, ArborError, ArborResult, JsonMap, NodeId, NodeStatus, NodeType, RunStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- Task lifecycle ---

/// A new node was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmitted {
    /// Id of the new node.
    pub node_id: NodeId,
    /// Human-readable path id ("0", "0.1", "0.1.2").
    pub node_nid: String,
    /// Plan or execute.
    pub node_type: NodeType,
    /// Free-form task category.
    pub task_type: String,
    /// What the node should achieve.
    pub goal: String,
    /// Depth in the decomposition (root is 0).
    pub layer: u32,
    /// Composite node owning this one; `None` for the root.
    #[serde(default)]
    pub outer_node_id: Option<NodeId>,
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: JsonMap,
}

/// A node's dependencies are all completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReady {
    /// Node that became ready.
    pub node_id: NodeId,
    /// Root node of the run.
    pub root_node_id: NodeId,
}

/// A node was bound to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssigned {
    /// Assigned node.
    pub node_id: NodeId,
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// `planner` for decompositions, `executor` for actions.
    pub worker_type: String,
    /// Action to run, when the node executes one.
    #[serde(default)]
    pub action_name: Option<String>,
}

/// Execution of a node began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStarted {
    /// Started node.
    pub node_id: NodeId,
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Worker instance running the node.
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// A node finished successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleted {
    /// Completed node.
    pub node_id: NodeId,
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Named outputs.
    #[serde(default)]
    pub result: JsonMap,
}

/// A node failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailed {
    /// Failed node.
    pub node_id: NodeId,
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Stable error class tag.
    pub error_type: String,
    /// Human-readable message.
    pub error_info: String,
    /// Extra diagnostic context.
    #[serde(default)]
    pub context: Option<JsonMap>,
}

/// A node result is ready downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultAvailable {
    /// Node that produced the result.
    pub node_id: NodeId,
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Action that produced it, if any.
    #[serde(default)]
    pub action_name: Option<String>,
    /// Short rendering of the result.
    pub result_summary: String,
}

// --- Graph structure ---

/// One child of a decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Id the child node will receive.
    pub node_id: NodeId,
    /// What the child should achieve.
    pub goal: String,
    /// Free-form task category.
    pub task_type: String,
    /// Plan or execute.
    pub node_type: NodeType,
    /// Siblings this child depends on.
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
}

/// A node decided to decompose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtasksPlanned {
    /// Composite node that owns the new inner graph.
    pub parent_node_id: NodeId,
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Children, in plan order.
    pub subtasks: Vec<SubtaskSpec>,
}

/// A child node was materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAdded {
    /// Composite node owning the inner graph.
    pub graph_owner_node_id: NodeId,
    /// Id of the new child.
    pub added_node_id: NodeId,
    /// Path id of the new child.
    pub added_node_nid: String,
    /// Task category of the child.
    pub task_type: String,
    /// Goal of the child.
    pub goal: String,
}

/// A dependency edge was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeAdded {
    /// Owner of the scope; `None` for the root scope.
    #[serde(default)]
    pub graph_owner_node_id: Option<NodeId>,
    /// Dependency source.
    pub parent_node_id: NodeId,
    /// Dependent node.
    pub child_node_id: NodeId,
    /// Path id of the source.
    pub parent_node_nid: String,
    /// Path id of the dependent.
    pub child_node_nid: String,
}

/// An inner graph is fully materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerGraphBuilt {
    /// Composite node owning the inner graph.
    pub node_id: NodeId,
    /// Nodes in the scope.
    pub node_count: usize,
    /// Edges in the scope.
    pub edge_count: usize,
    /// Children, in plan order.
    pub node_ids: Vec<NodeId>,
}

/// Audit record of a status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusChanged {
    /// Node that changed.
    pub node_id: NodeId,
    /// Path id of the node.
    pub node_nid: String,
    /// Goal of the node.
    pub node_goal: String,
    /// Status before.
    pub old_status: NodeStatus,
    /// Status after.
    pub new_status: NodeStatus,
    /// Task category of the node.
    pub task_type: String,
}

// --- Model and tool calls ---

/// Token accounting reported by a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
    /// Sum of the two.
    pub total_tokens: u64,
}

/// A model call started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallStarted {
    /// Node on whose behalf the call is made.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Component making the call ("planner", "executor").
    pub agent_class: String,
    /// Model identifier.
    pub model: String,
    /// Truncated last message of the conversation.
    pub prompt_preview: String,
}

/// A model call returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallCompleted {
    /// Node on whose behalf the call was made.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Component that made the call.
    pub agent_class: String,
    /// Model identifier.
    pub model: String,
    /// Wall-clock duration.
    pub duration_seconds: f64,
    /// Token accounting, when the model reports it.
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    /// Truncated response text.
    #[serde(default)]
    pub response_preview: Option<String>,
    /// Error message if the call failed.
    #[serde(default)]
    pub error: Option<String>,
}

/// An action invocation started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvoked {
    /// Node executing the action.
    pub node_id: NodeId,
    /// Action name.
    pub tool_name: String,
    /// Compact rendering of the arguments.
    pub args_summary: String,
}

/// An action invocation returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolReturned {
    /// Node executing the action.
    pub node_id: NodeId,
    /// Action name.
    pub tool_name: String,
    /// Normalized action status.
    pub state: ActionStatus,
    /// Wall-clock duration.
    pub duration_seconds: f64,
    /// Compact rendering of the outputs.
    #[serde(default)]
    pub output_summary: Option<String>,
    /// Error message for failure/error statuses.
    #[serde(default)]
    pub error: Option<String>,
}

// --- Run lifecycle ---

/// A run started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStarted {
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Root goal.
    pub goal: String,
    /// Root task category.
    pub task_type: String,
    /// Effective configuration.
    #[serde(default)]
    pub config: JsonMap,
}

/// A run ended. Always the last event of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinished {
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Final run status.
    pub status: RunStatus,
    /// Wall-clock duration of the run.
    pub total_duration_seconds: f64,
    /// Nodes created during the run.
    pub total_nodes: usize,
    /// Node count per status wire name.
    #[serde(default)]
    pub node_statistics: BTreeMap<String, usize>,
    /// Model calls made.
    #[serde(default)]
    pub llm_calls: u64,
    /// Action invocations made.
    #[serde(default)]
    pub tool_calls: u64,
    /// Tokens consumed across all model calls.
    #[serde(default)]
    pub total_tokens: u64,
    /// Outputs of the root node, on success.
    #[serde(default)]
    pub result: Option<JsonMap>,
}

/// A run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    /// Root node of the run.
    #[serde(default)]
    pub root_node_id: Option<NodeId>,
    /// Node where the failure originated.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Stable error class tag.
    pub error_type: String,
    /// Human-readable message.
    pub error_message: String,
    /// Source chain or backtrace.
    #[serde(default)]
    pub stack_trace: Option<String>,
    /// Extra diagnostic context.
    #[serde(default)]
    pub context: Option<JsonMap>,
}

// --- Envelope payload ---

macro_rules! event_payloads {
    ($($variant:ident),+ $(,)?) => {
        /// The typed payload of an [`Event`](crate::Event).
        ///
        /// Serializes as the bare inner struct; the envelope carries the type.
        #[derive(Debug, Clone, PartialEq, Serialize)]
        #[serde(untagged)]
        pub enum EventPayload {
            $(
                #[allow(missing_docs)]
                $variant($variant),
            )+
        }

        impl EventPayload {
            /// Event type of this payload.
            pub fn event_type(&self) -> EventType {
                match self {
                    $(EventPayload::$variant(_) => EventType::$variant,)+
                }
            }

            /// Decode a raw payload declared as `event_type`.
            ///
            /// Fails with [`ArborError::InvalidPayload`] when the value is not an
            /// object or does not match the schema of the declared type.
            pub fn decode(event_type: EventType, value: serde_json::Value) -> ArborResult<Self> {
                if !value.is_object() {
                    return Err(ArborError::InvalidPayload {
                        event_type: event_type.to_string(),
                        reason: "payload must be a JSON object".to_string(),
                    });
                }
                let invalid = |e: serde_json::Error| ArborError::InvalidPayload {
                    event_type: event_type.to_string(),
                    reason: e.to_string(),
                };
                match event_type {
                    $(EventType::$variant => serde_json::from_value::<$variant>(value)
                        .map(EventPayload::$variant)
                        .map_err(invalid),)+
                }
            }
        }

        $(
            impl From<$variant> for EventPayload {
                fn from(payload: $variant) -> Self {
                    EventPayload::$variant(payload)
                }
            }
        )+
    };
}

event_payloads!(
    TaskSubmitted,
    TaskReady,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskResultAvailable,
    SubtasksPlanned,
    NodeAdded,
    EdgeAdded,
    InnerGraphBuilt,
    NodeStatusChanged,
    LlmCallStarted,
    LlmCallCompleted,
    ToolInvoked,
    ToolReturned,
    RunStarted,
    RunFinished,
    RunError,
);

impl EventPayload {
    /// The node this payload is primarily about, if any.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            EventPayload::TaskSubmitted(p) => Some(p.node_id),
            EventPayload::TaskReady(p) => Some(p.node_id),
            EventPayload::TaskAssigned(p) => Some(p.node_id),
            EventPayload::TaskStarted(p) => Some(p.node_id),
            EventPayload::TaskCompleted(p) => Some(p.node_id),
            EventPayload::TaskFailed(p) => Some(p.node_id),
            EventPayload::TaskResultAvailable(p) => Some(p.node_id),
            EventPayload::SubtasksPlanned(p) => Some(p.parent_node_id),
            EventPayload::NodeAdded(p) => Some(p.added_node_id),
            EventPayload::EdgeAdded(p) => Some(p.child_node_id),
            EventPayload::InnerGraphBuilt(p) => Some(p.node_id),
            EventPayload::NodeStatusChanged(p) => Some(p.node_id),
            EventPayload::LlmCallStarted(p) => p.node_id,
            EventPayload::LlmCallCompleted(p) => p.node_id,
            EventPayload::ToolInvoked(p) => Some(p.node_id),
            EventPayload::ToolReturned(p) => Some(p.node_id),
            EventPayload::RunStarted(p) => Some(p.root_node_id),
            EventPayload::RunFinished(p) => Some(p.root_node_id),
            EventPayload::RunError(p) => p.node_id.or(p.root_node_id),
        }
    }
}
