//! Core types and error definitions for the Arbor orchestration engine.
//!
//! This crate provides the vocabulary shared by every Arbor crate: the unified
//! error enum, node and run status enums, and a few id/map aliases.
//!
//! # Main types
//!
//! - [`ArborError`]: Unified error enum for all Arbor subsystems.
//! - [`ArborResult`]: Convenience alias for `Result<T, ArborError>`.
//! - [`NodeStatus`]: Task node state machine.
//! - [`NodeType`]: Whether a node plans (decomposes) or executes.
//! - [`ActionStatus`]: Normalized outcome of an action invocation.
//! - [`RunStatus`]: Lifecycle of a whole run.

/// Status enums and the node state machine.
pub mod status;

pub use status::{ActionStatus, NodeStatus, NodeType, RunStatus};

use uuid::Uuid;

/// Identifier of a node in the task graph.
pub type NodeId = Uuid;

/// Identifier of a run.
pub type RunId = Uuid;

/// A JSON object, used for action arguments, outputs and free-form metadata.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// --- Error types ---

/// Top-level error type for Arbor.
///
/// Each variant corresponds to one class of failure. [`ArborError::error_type`]
/// gives a stable tag that is carried in `TaskFailed` and `RunError` events.
#[derive(Debug, thiserror::Error)]
pub enum ArborError {
    /// A malformed input: bad payload, bad plan, bad argument.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An event payload that does not match its declared event type.
    #[error("Invalid payload for {event_type}: {reason}")]
    InvalidPayload {
        /// Wire name of the declared event type.
        event_type: String,
        /// Decoder message.
        reason: String,
    },

    /// No action is registered under the requested name.
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    /// An action with this name was already registered.
    #[error("Duplicate action registration: {0}")]
    DuplicateAction(String),

    /// A required action parameter was not supplied.
    #[error("Missing required parameter '{parameter}' for action '{action}'")]
    MissingParameter {
        /// Action being invoked.
        action: String,
        /// Name of the absent parameter.
        parameter: String,
    },

    /// An action parameter has the wrong type.
    #[error("Parameter '{parameter}' of action '{action}' must be {expected}, got {actual}")]
    InvalidParameter {
        /// Action being invoked.
        action: String,
        /// Parameter name.
        parameter: String,
        /// Declared type tag.
        expected: String,
        /// Observed JSON type.
        actual: String,
    },

    /// An action body reported a failure.
    #[error("Action error: {0}")]
    Action(String),

    /// Work was cancelled or its deadline passed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The event bus no longer accepts publishes or subscriptions.
    #[error("Event bus is closed")]
    BusClosed,

    /// Any other event bus failure.
    #[error("Bus error: {0}")]
    Bus(String),

    /// An event handler returned an error.
    #[error("Handler error: {0}")]
    Handler(String),

    /// An event handler panicked; the panic was caught at the bus boundary.
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// No node with this id exists in the graph.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// A status change that the node state machine does not allow.
    #[error("Illegal transition for node {node_id}: {from} -> {to}")]
    IllegalTransition {
        /// Node whose status was being changed.
        node_id: NodeId,
        /// Current status.
        from: NodeStatus,
        /// Requested status.
        to: NodeStatus,
    },

    /// A structural graph violation (scope mismatch, cycle, duplicate id).
    #[error("Graph error: {0}")]
    Graph(String),

    /// A failure from the language model boundary.
    #[error("LLM error: {0}")]
    Llm(String),

    /// A planner could not produce a decision.
    #[error("Planner error: {0}")]
    Planner(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArborError {
    /// Stable, machine-readable tag for this error class.
    pub fn error_type(&self) -> &'static str {
        match self {
            ArborError::Validation(_) => "validation",
            ArborError::InvalidPayload { .. } => "invalid_payload",
            ArborError::ActionNotFound(_) => "action_not_found",
            ArborError::DuplicateAction(_) => "duplicate_action",
            ArborError::MissingParameter { .. } => "missing_parameter",
            ArborError::InvalidParameter { .. } => "invalid_parameter",
            ArborError::Action(_) => "action_failed",
            ArborError::Cancelled(_) => "cancelled",
            ArborError::BusClosed => "bus_closed",
            ArborError::Bus(_) => "bus",
            ArborError::Handler(_) => "handler",
            ArborError::HandlerPanic(_) => "handler_panic",
            ArborError::NodeNotFound(_) => "node_not_found",
            ArborError::IllegalTransition { .. } => "illegal_transition",
            ArborError::Graph(_) => "graph",
            ArborError::Llm(_) => "llm",
            ArborError::Planner(_) => "planner",
            ArborError::Config(_) => "config",
            ArborError::Json(_) => "json",
            ArborError::Io(_) => "io",
        }
    }

    /// Whether the bus should retry a handler that failed with this error.
    ///
    /// Validation-class failures and caught panics are reported once.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ArborError::Validation(_)
                | ArborError::InvalidPayload { .. }
                | ArborError::HandlerPanic(_)
                | ArborError::BusClosed
                | ArborError::IllegalTransition { .. }
                | ArborError::Json(_)
        )
    }
}

/// A convenience `Result` alias using [`ArborError`].
pub type ArborResult<T> = Result<T, ArborError>;
