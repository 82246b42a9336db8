use arbor_core::{ActionStatus, ArborError, ArborResult, JsonMap, NodeId, RunId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Type tag of an action parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// JSON string.
    String,
    /// JSON number without a fractional part.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
    /// Anything, including null.
    Any,
}

impl ParamType {
    /// Wire name of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
            ParamType::Any => "any",
        }
    }

    /// Whether `value` satisfies this tag.
    pub fn accepts(self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => match value {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                _ => false,
            },
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the JSON type of `value`, for error messages.
pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One named parameter of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Argument key.
    pub name: String,
    /// Type tag.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Human description.
    pub description: String,
    /// Whether the argument must be present.
    pub required: bool,
    /// Value used when an optional argument is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ParameterSpec {
    /// A required parameter.
    pub fn required(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
        }
    }

    /// An optional parameter without a default.
    pub fn optional(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    /// Set the default used when the argument is absent.
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Name, description and parameter schema of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// Unique action name.
    pub name: String,
    /// What the action does, phrased for a planner.
    pub description: String,
    /// Parameters in declaration order.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl ActionDescriptor {
    /// Descriptor without parameters.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a parameter.
    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Look up a parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Normalized outcome of an action.
///
/// `error` is set exactly when `status` is `failure` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Outcome class.
    pub status: ActionStatus,
    /// Named outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonMap>,
    /// Error message for failure/error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    /// A successful result with outputs.
    pub fn success(result: JsonMap) -> Self {
        Self {
            status: ActionStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    /// The action ran but did not achieve its goal.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failure,
            result: None,
            error: Some(message.into()),
        }
    }

    /// The action could not run.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Error,
            result: None,
            error: Some(message.into()),
        }
    }

    /// Accepted but not started.
    pub fn pending() -> Self {
        Self {
            status: ActionStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// Whether the status is `success`.
    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }

    /// Enforce the status/error pairing.
    ///
    /// Failure statuses without a message get a generic one; other statuses
    /// drop a stray message.
    pub fn normalized(mut self, action_name: &str) -> Self {
        if self.status.requires_error() {
            if self.error.as_deref().map_or(true, str::is_empty) {
                self.error = Some(format!(
                    "action '{action_name}' returned status {} without a message",
                    self.status
                ));
            }
        } else {
            self.error = None;
        }
        self
    }

    /// Short single-line rendering of the outputs.
    pub fn summary(&self, max_chars: usize) -> String {
        let text = match (&self.result, &self.error) {
            (_, Some(error)) => error.clone(),
            (Some(result), None) => serde_json::Value::Object(result.clone()).to_string(),
            (None, None) => self.status.to_string(),
        };
        truncate(&text, max_chars)
    }
}

/// Truncate to at most `max_chars` characters, marking the cut with "...".
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Execution context handed to every action.
///
/// Carries the cancellation token and optional deadline of the invocation.
/// A timeout is just a deadline; both surface as [`ArborError::Cancelled`].
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Run the invocation belongs to.
    pub run_id: RunId,
    /// Node on whose behalf the action runs.
    pub node_id: Option<NodeId>,
    /// Cancels the invocation.
    pub cancel: CancellationToken,
    /// Absolute deadline.
    pub deadline: Option<Instant>,
}

impl ActionContext {
    /// Context for a run, with a fresh token and no deadline.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            node_id: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Attach the node being executed.
    pub fn for_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Use `token` (typically a child of the run token).
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Whether the token is cancelled or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast if the invocation is already cancelled.
    pub fn check(&self) -> ArborResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ArborError::Cancelled("invocation cancelled".to_string()));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ArborError::Cancelled("deadline exceeded".to_string()));
        }
        Ok(())
    }

    /// Resolves when the invocation is cancelled or the deadline passes.
    pub async fn interrupted(&self) -> ArborError {
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => ArborError::Cancelled("invocation cancelled".to_string()),
            _ = deadline => ArborError::Cancelled("deadline exceeded".to_string()),
        }
    }
}

/// A named, schema-described unit of executable capability.
///
/// Implementations should watch `ctx` in long-running work; the executor
/// also races every invocation against [`ActionContext::interrupted`].
#[async_trait]
pub trait Action: Send + Sync {
    /// Name, description and parameter schema.
    fn descriptor(&self) -> &ActionDescriptor;

    /// Run with validated arguments (defaults already applied).
    async fn execute(&self, ctx: &ActionContext, args: JsonMap) -> ArborResult<ActionResult>;
}
