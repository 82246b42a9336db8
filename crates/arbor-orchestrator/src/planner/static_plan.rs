use super::{ActionCall, Decision, PlanContext, Planner};
use arbor_core::{ArborError, ArborResult, NodeId, NodeType};
use arbor_events::payload::SubtaskSpec;
use arbor_graph::{has_cycle, Node};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

/// A task tree read from a plan file.
///
/// ```toml
/// goal = "Greet twice"
///
/// [[subtasks]]
/// id = "first"
/// goal = "Say hello"
/// action = { name = "echo", args = { message = "hello" } }
///
/// [[subtasks]]
/// goal = "Say goodbye"
/// depends_on = ["first"]
/// action = { name = "echo", args = { message = "bye" } }
/// ```
///
/// A task either has subtasks or an action. `depends_on` names siblings by
/// `id`, or by `goal` for siblings without an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    /// Name siblings use in `depends_on`.
    #[serde(default)]
    pub id: Option<String>,
    /// What the task should achieve.
    pub goal: String,
    /// Task category, `GENERAL` by default.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Siblings that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Action bound to a leaf task.
    #[serde(default)]
    pub action: Option<ActionCall>,
    /// Inner graph of a composite task.
    #[serde(default)]
    pub subtasks: Vec<PlanSpec>,
}

fn default_task_type() -> String {
    "EXECUTION".to_string()
}

impl PlanSpec {
    /// Parse and validate a TOML plan.
    pub fn from_toml_str(text: &str) -> ArborResult<Self> {
        let plan: PlanSpec =
            toml::from_str(text).map_err(|e| ArborError::Validation(format!("invalid plan: {e}")))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Read, parse and validate a TOML plan file.
    pub fn load(path: impl AsRef<Path>) -> ArborResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Key siblings use to reference this task.
    pub fn key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.goal)
    }

    /// Node type the task gets in the graph.
    pub fn node_type(&self) -> NodeType {
        if self.subtasks.is_empty() {
            NodeType::Execute
        } else {
            NodeType::Plan
        }
    }

    /// Check the whole tree.
    pub fn validate(&self) -> ArborResult<()> {
        if self.goal.trim().is_empty() {
            return Err(ArborError::Validation("plan task with empty goal".into()));
        }
        match (&self.action, self.subtasks.is_empty()) {
            (Some(_), false) => {
                return Err(ArborError::Validation(format!(
                    "task '{}' has both an action and subtasks",
                    self.key()
                )))
            }
            (None, true) => {
                return Err(ArborError::Validation(format!(
                    "task '{}' has neither an action nor subtasks",
                    self.key()
                )))
            }
            _ => {}
        }

        let mut ids = HashMap::new();
        for child in &self.subtasks {
            if ids.insert(child.key(), Uuid::new_v4()).is_some() {
                return Err(ArborError::Validation(format!(
                    "duplicate subtask '{}' under '{}'",
                    child.key(),
                    self.key()
                )));
            }
        }
        let mut deps = HashMap::new();
        for child in &self.subtasks {
            let mut resolved = Vec::with_capacity(child.depends_on.len());
            for dep in &child.depends_on {
                let id = ids.get(dep.as_str()).ok_or_else(|| {
                    ArborError::Validation(format!(
                        "task '{}' depends on unknown sibling '{dep}'",
                        child.key()
                    ))
                })?;
                resolved.push(*id);
            }
            deps.insert(ids[child.key()], resolved);
        }
        if has_cycle(&deps) {
            return Err(ArborError::Validation(format!(
                "subtasks of '{}' have a dependency cycle",
                self.key()
            )));
        }
        self.subtasks.iter().try_for_each(PlanSpec::validate)
    }

    /// The task at a node path id: "0" is the root, "0.2" its second subtask.
    pub fn find(&self, nid: &str) -> Option<&PlanSpec> {
        let mut parts = nid.split('.');
        if parts.next()? != "0" {
            return None;
        }
        parts.try_fold(self, |spec, part| {
            let k: usize = part.parse().ok()?;
            spec.subtasks.get(k.checked_sub(1)?)
        })
    }
}

/// Replays a fixed [`PlanSpec`]: nodes are matched to plan tasks by path id.
pub struct StaticPlanner {
    plan: PlanSpec,
}

impl StaticPlanner {
    /// Fails if the plan is invalid.
    pub fn new(plan: PlanSpec) -> ArborResult<Self> {
        plan.validate()?;
        Ok(Self { plan })
    }

    /// The plan being replayed.
    pub fn plan(&self) -> &PlanSpec {
        &self.plan
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn decide(&self, node: &Node, _ctx: &PlanContext) -> ArborResult<Decision> {
        let spec = self.plan.find(&node.node_nid).ok_or_else(|| {
            ArborError::Planner(format!("no plan entry for node {}", node.node_nid))
        })?;
        if let Some(action) = &spec.action {
            debug!(nid = %node.node_nid, action = %action.name, "Static plan: act");
            return Ok(Decision::Act(action.clone()));
        }

        let ids: HashMap<&str, NodeId> = spec
            .subtasks
            .iter()
            .map(|c| (c.key(), Uuid::new_v4()))
            .collect();
        let subtasks = spec
            .subtasks
            .iter()
            .map(|c| SubtaskSpec {
                node_id: ids[c.key()],
                goal: c.goal.clone(),
                task_type: c.task_type.clone(),
                node_type: c.node_type(),
                dependencies: c
                    .depends_on
                    .iter()
                    .filter_map(|d| ids.get(d.as_str()).copied())
                    .collect(),
            })
            .collect::<Vec<_>>();
        debug!(nid = %node.node_nid, count = subtasks.len(), "Static plan: decompose");
        Ok(Decision::Decompose(subtasks))
    }
}
