use serde::{Deserialize, Serialize};

/// Status of a node in the task graph.
///
/// ```text
/// NOT_READY -> READY -> ASSIGNED -> RUNNING -> COMPLETED
///                                           \-> FAILED
/// ```
///
/// Any non-terminal status may also move straight to `FAILED` when a failure
/// is propagated to it. Nothing leaves `COMPLETED` or `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Waiting on at least one dependency.
    NotReady,
    /// All dependencies completed; awaiting a decision.
    Ready,
    /// Bound to a worker/action, queued for a concurrency slot.
    Assigned,
    /// Execution in progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error, or failed by propagation.
    Failed,
}

impl NodeStatus {
    /// All statuses in state machine order.
    pub const ALL: [NodeStatus; 6] = [
        NodeStatus::NotReady,
        NodeStatus::Ready,
        NodeStatus::Assigned,
        NodeStatus::Running,
        NodeStatus::Completed,
        NodeStatus::Failed,
    ];

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::NotReady => "NOT_READY",
            NodeStatus::Ready => "READY",
            NodeStatus::Assigned => "ASSIGNED",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Completed => "COMPLETED",
            NodeStatus::Failed => "FAILED",
        }
    }

    /// `COMPLETED` and `FAILED` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// Identity transitions are not edges; callers treat them as no-ops.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            (NotReady, Ready) | (Ready, Assigned) | (Assigned, Running) => true,
            (Running, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a node decomposes into an inner graph or executes an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    /// Composite node: produces subtasks.
    Plan,
    /// Leaf node: runs an action.
    Execute,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Plan => write!(f, "PLAN"),
            NodeType::Execute => write!(f, "EXECUTE"),
        }
    }
}

/// Normalized outcome of an action invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// The action did what was asked.
    Success,
    /// The action ran but its goal was not met.
    Failure,
    /// Still in progress (long-running actions).
    Running,
    /// Accepted, not yet started.
    Pending,
    /// The action could not run at all.
    Error,
}

impl ActionStatus {
    /// Whether a result with this status must carry an error message.
    pub fn requires_error(self) -> bool {
        matches!(self, ActionStatus::Failure | ActionStatus::Error)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionStatus::Success => write!(f, "success"),
            ActionStatus::Failure => write!(f, "failure"),
            ActionStatus::Running => write!(f, "running"),
            ActionStatus::Pending => write!(f, "pending"),
            ActionStatus::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Root node not yet terminal.
    Running,
    /// Root node completed.
    Completed,
    /// Root node failed, the run stalled, or a fatal error aborted it.
    Failed,
}

impl RunStatus {
    /// Whether the run has ended.
    pub fn is_finished(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_steps_allowed() {
        assert!(NodeStatus::NotReady.can_transition_to(NodeStatus::Ready));
        assert!(NodeStatus::Ready.can_transition_to(NodeStatus::Assigned));
        assert!(NodeStatus::Assigned.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Completed));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Failed));
    }

    #[test]
    fn test_skips_rejected() {
        assert!(!NodeStatus::Ready.can_transition_to(NodeStatus::Running));
        assert!(!NodeStatus::NotReady.can_transition_to(NodeStatus::Assigned));
        assert!(!NodeStatus::Assigned.can_transition_to(NodeStatus::Completed));
        assert!(!NodeStatus::Running.can_transition_to(NodeStatus::Ready));
    }

    #[test]
    fn test_failure_propagation_from_any_live_state() {
        for from in [
            NodeStatus::NotReady,
            NodeStatus::Ready,
            NodeStatus::Assigned,
            NodeStatus::Running,
        ] {
            assert!(from.can_transition_to(NodeStatus::Failed), "{from}");
        }
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        for from in [NodeStatus::Completed, NodeStatus::Failed] {
            for to in NodeStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::NotReady).unwrap(),
            "\"NOT_READY\""
        );
        assert_eq!(serde_json::to_string(&NodeType::Execute).unwrap(), "\"EXECUTE\"");
        assert_eq!(serde_json::to_string(&ActionStatus::Error).unwrap(), "\"error\"");
        let parsed: NodeStatus = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(parsed, NodeStatus::Completed);
    }

    #[test]
    fn test_action_status_error_requirement() {
        assert!(ActionStatus::Error.requires_error());
        assert!(ActionStatus::Failure.requires_error());
        assert!(!ActionStatus::Success.requires_error());
        assert!(!ActionStatus::Pending.requires_error());
    }
}
