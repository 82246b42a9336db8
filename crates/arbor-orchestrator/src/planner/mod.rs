//! Planning decisions: what a READY node should do.
//!
//! A [`Planner`] looks at a node and either binds it to an action or splits
//! it into subtasks. It never touches the graph or the bus; the engine turns
//! the [`Decision`] into events.

mod llm;
mod static_plan;

pub use llm::LlmPlanner;
pub use static_plan::{PlanSpec, StaticPlanner};

use arbor_actions::ActionResult;
use arbor_core::{ArborResult, JsonMap, NodeId, RunId};
use arbor_events::payload::SubtaskSpec;
use arbor_graph::Node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// An action invocation chosen for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    /// Registered action name.
    pub name: String,
    /// Arguments, validated against the action's schema at execution.
    #[serde(default)]
    pub args: JsonMap,
}

impl ActionCall {
    /// Call `name` with `args`.
    pub fn new(name: impl Into<String>, args: JsonMap) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// What a READY node does next.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Execute an action.
    Act(ActionCall),
    /// Split into subtasks. An empty list completes the node.
    Decompose(Vec<SubtaskSpec>),
}

impl Decision {
    /// `worker_type` reported in `TaskAssigned`.
    pub fn worker_type(&self) -> &'static str {
        match self {
            Decision::Act(_) => "executor",
            Decision::Decompose(_) => "planner",
        }
    }

    /// Bound action, for `TaskAssigned`.
    pub fn action_name(&self) -> Option<&str> {
        match self {
            Decision::Act(call) => Some(&call.name),
            Decision::Decompose(_) => None,
        }
    }
}

/// One executed action and its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// What was invoked.
    pub call: ActionCall,
    /// What it returned.
    pub result: ActionResult,
}

/// Run-level information available to a planner.
#[derive(Debug, Clone)]
pub struct PlanContext {
    /// Run being planned.
    pub run_id: RunId,
    /// Root node of the run.
    pub root_node_id: NodeId,
    /// Cancelled when the run ends.
    pub cancel: CancellationToken,
}

/// Decides how nodes are handled.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Decide for a node that just became READY.
    async fn decide(&self, node: &Node, ctx: &PlanContext) -> ArborResult<Decision>;

    /// After each action of an acting node, pick the next one or stop.
    ///
    /// `history` holds every step of the node so far, oldest first. Returning
    /// `None` ends the node: it completes if the last step succeeded and
    /// fails otherwise. A successful `finish` always ends the node without
    /// asking.
    async fn next_action(
        &self,
        _node: &Node,
        _history: &[Step],
        _ctx: &PlanContext,
    ) -> ArborResult<Option<ActionCall>> {
        Ok(None)
    }
}
