use arbor_core::{ArborError, ArborResult};
use arbor_events::TASK_TOPIC;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings of the orchestration loop (`[orchestrator]` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// `source_service` stamped on every event the loop publishes.
    #[serde(default = "default_source_service")]
    pub source_service: String,
    /// Topic carrying task lifecycle events.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Nodes allowed in RUNNING at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Fail dependents and owners of a failed node.
    #[serde(default = "default_cascade_failures")]
    pub cascade_failures: bool,
    /// Deadline per action invocation; 0 disables it.
    #[serde(default)]
    pub action_timeout_ms: u64,
    /// Deepest layer a planner may still decompose.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Actions a single node may run before it is failed.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
}

fn default_source_service() -> String {
    "arbor-orchestrator".to_string()
}

fn default_topic() -> String {
    TASK_TOPIC.to_string()
}

fn default_max_concurrency() -> usize {
    4
}

fn default_cascade_failures() -> bool {
    true
}

fn default_max_depth() -> u32 {
    3
}

fn default_max_turns() -> u32 {
    10
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            source_service: default_source_service(),
            topic: default_topic(),
            max_concurrency: default_max_concurrency(),
            cascade_failures: default_cascade_failures(),
            action_timeout_ms: 0,
            max_depth: default_max_depth(),
            max_turns: default_max_turns(),
        }
    }
}

impl OrchestratorConfig {
    /// Reject values the loop cannot run with.
    pub fn validate(&self) -> ArborResult<()> {
        if self.topic.is_empty() {
            return Err(ArborError::Config("orchestrator.topic must not be empty".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ArborError::Config(
                "orchestrator.max_concurrency must be at least 1".into(),
            ));
        }
        if self.max_turns == 0 {
            return Err(ArborError::Config(
                "orchestrator.max_turns must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Per-action deadline, if any.
    pub fn action_timeout(&self) -> Option<Duration> {
        (self.action_timeout_ms > 0).then(|| Duration::from_millis(self.action_timeout_ms))
    }
}

/// Settings of the model boundary (`[llm]` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name reported in LLM call events.
    #[serde(default = "default_model")]
    pub model: String,
    /// Characters of prompt and response kept in event previews.
    #[serde(default = "default_prompt_preview_chars")]
    pub prompt_preview_chars: usize,
}

fn default_model() -> String {
    "unspecified".to_string()
}

fn default_prompt_preview_chars() -> usize {
    256
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            prompt_preview_chars: default_prompt_preview_chars(),
        }
    }
}
