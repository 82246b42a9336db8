use super::{ActionCall, Decision, PlanContext, Planner, Step};
use crate::llm::{LanguageModel, LlmContext, LlmMessage};
use arbor_actions::builtins::{FINISH, INVALID_ACTION, NO_ACTION};
use arbor_actions::ActionRegistry;
use arbor_core::{ArborError, ArborResult, JsonMap, NodeType};
use arbor_events::payload::SubtaskSpec;
use arbor_graph::Node;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PLAN_PROMPT: &str = r#"You are a planning assistant. Break the user's goal into smaller, manageable subtasks.
Output a JSON object with a single key "subtasks", an array of objects with these keys:
- "goal": what the subtask achieves.
- "type": a short category such as "RESEARCH", "EXECUTION" or "REVIEW".
- "dependencies": the "goal" of every other subtask that must finish first, or [].
- "decompose": true if the subtask is itself large enough to be broken down further.
Respond only with the JSON object."#;

const ACT_PROMPT: &str = r#"You are an agent working towards a goal one action at a time.
Each turn, think about the goal and the observations so far, then choose exactly one action.
Respond only with a JSON object:
{"thought": "...", "action": {"action_name": "...", "action_args": {...}}}
Use the "finish" action with a "final_answer" once the goal is achieved."#;

#[derive(Debug, Deserialize)]
struct PlanReply {
    subtasks: Vec<PlannedSubtask>,
}

#[derive(Debug, Deserialize)]
struct PlannedSubtask {
    goal: String,
    #[serde(default, rename = "type")]
    task_type: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    decompose: bool,
}

#[derive(Debug, Deserialize)]
struct ActReply {
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    action: Option<ActReplyAction>,
}

#[derive(Debug, Deserialize)]
struct ActReplyAction {
    action_name: String,
    #[serde(default)]
    action_args: JsonMap,
}

/// Plans and acts by asking a [`LanguageModel`].
///
/// PLAN nodes above `max_depth` are decomposed from a JSON subtask list;
/// every other node runs a think/act/observe loop choosing one registered
/// action per turn. Replies that cannot be parsed become `no_action`, and
/// unregistered names become `invalid_action`, so the model sees its mistake
/// as the next observation.
pub struct LlmPlanner {
    model: Arc<dyn LanguageModel>,
    registry: Arc<ActionRegistry>,
    max_depth: u32,
    fenced_json: Regex,
}

impl LlmPlanner {
    /// Plan with `model`, offering the actions in `registry`.
    pub fn new(
        model: Arc<dyn LanguageModel>,
        registry: Arc<ActionRegistry>,
        max_depth: u32,
    ) -> ArborResult<Self> {
        let fenced_json = Regex::new(r"(?s)```(?:json)?\s*(.*?)```")
            .map_err(|e| ArborError::Planner(format!("invalid JSON fence pattern: {e}")))?;
        Ok(Self {
            model,
            registry,
            max_depth,
            fenced_json,
        })
    }

    /// The JSON inside a fenced block, or the whole text.
    pub fn extract_json<'a>(&self, text: &'a str) -> &'a str {
        self.fenced_json
            .captures(text)
            .and_then(|c| c.get(1))
            .map_or(text, |m| m.as_str())
            .trim()
    }

    fn llm_context(&self, node: &Node, ctx: &PlanContext, agent_class: &str) -> LlmContext {
        LlmContext::new(ctx.run_id, agent_class)
            .for_node(node.node_id)
            .with_cancel(ctx.cancel.clone())
    }

    async fn decompose(&self, node: &Node, ctx: &PlanContext) -> ArborResult<Decision> {
        let messages = [
            LlmMessage::system(PLAN_PROMPT),
            LlmMessage::user(format!(
                "Break down the following goal into subtasks:\n\nGoal: {}",
                node.goal
            )),
        ];
        let reply = self
            .model
            .generate(&self.llm_context(node, ctx, "planner"), &messages)
            .await?;
        let plan: PlanReply = serde_json::from_str(self.extract_json(&reply.content))
            .map_err(|e| ArborError::Planner(format!("unparseable plan from model: {e}")))?;

        let ids: HashMap<&str, Uuid> = plan
            .subtasks
            .iter()
            .map(|s| (s.goal.as_str(), Uuid::new_v4()))
            .collect();
        let can_nest = node.layer + 1 < self.max_depth;
        let mut subtasks = Vec::with_capacity(plan.subtasks.len());
        for planned in &plan.subtasks {
            let mut dependencies = Vec::new();
            for dep in &planned.dependencies {
                match ids.get(dep.as_str()) {
                    Some(id) => dependencies.push(*id),
                    None => warn!(
                        node_id = %node.node_id,
                        subtask = %planned.goal,
                        dependency = %dep,
                        "Plan dependency does not name a sibling, ignoring"
                    ),
                }
            }
            subtasks.push(SubtaskSpec {
                node_id: ids[planned.goal.as_str()],
                goal: planned.goal.clone(),
                task_type: planned
                    .task_type
                    .clone()
                    .unwrap_or_else(|| "EXECUTION".to_string()),
                node_type: if planned.decompose && can_nest {
                    NodeType::Plan
                } else {
                    NodeType::Execute
                },
                dependencies,
            });
        }
        info!(node_id = %node.node_id, count = subtasks.len(), "Model planned subtasks");
        Ok(Decision::Decompose(subtasks))
    }

    async fn act(&self, node: &Node, history: &[Step], ctx: &PlanContext) -> ArborResult<ActionCall> {
        let mut transcript = format!("Goal: {}\n", node.goal);
        for (i, step) in history.iter().enumerate() {
            let _ = write!(
                transcript,
                "\nTurn {}:\nAction: {{\"action_name\": \"{}\", \"action_args\": {}}}\nObservation: {}\n",
                i + 1,
                step.call.name,
                serde_json::Value::Object(step.call.args.clone()),
                step.result.summary(1000)
            );
        }
        let messages = [
            LlmMessage::system(format!("{ACT_PROMPT}\n\n{}", self.registry.render_catalog())),
            LlmMessage::user(transcript),
        ];
        let reply = self
            .model
            .generate(&self.llm_context(node, ctx, "executor"), &messages)
            .await?;

        let parsed = serde_json::from_str::<ActReply>(self.extract_json(&reply.content));
        let call = match parsed {
            Ok(ActReply {
                thought,
                action: Some(action),
            }) => {
                debug!(node_id = %node.node_id, thought = ?thought, action = %action.action_name, "Model chose action");
                if self.registry.contains(&action.action_name) {
                    ActionCall::new(action.action_name, action.action_args)
                } else {
                    let mut args = JsonMap::new();
                    args.insert(
                        "reason".into(),
                        format!("Action '{}' is not registered", action.action_name).into(),
                    );
                    ActionCall::new(INVALID_ACTION, args)
                }
            }
            Ok(_) => ActionCall::new(NO_ACTION, JsonMap::new()),
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "Unparseable action reply, using no_action");
                ActionCall::new(NO_ACTION, JsonMap::new())
            }
        };
        Ok(call)
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn decide(&self, node: &Node, ctx: &PlanContext) -> ArborResult<Decision> {
        if node.node_type == NodeType::Plan && node.layer < self.max_depth {
            self.decompose(node, ctx).await
        } else {
            Ok(Decision::Act(self.act(node, &[], ctx).await?))
        }
    }

    async fn next_action(
        &self,
        node: &Node,
        history: &[Step],
        ctx: &PlanContext,
    ) -> ArborResult<Option<ActionCall>> {
        match history.last() {
            Some(last) if last.call.name == FINISH && last.result.is_success() => Ok(None),
            _ => Ok(Some(self.act(node, history, ctx).await?)),
        }
    }
}
