use crate::action::{Action, ActionContext, ActionDescriptor, ActionResult, ParamType, ParameterSpec};
use arbor_core::{ArborError, ArborResult, JsonMap};
use async_trait::async_trait;
use serde_json::json;

/// Echoes back a message, optionally repeated.
pub struct EchoAction {
    descriptor: ActionDescriptor,
}

impl EchoAction {
    /// The `echo` action.
    pub fn new() -> Self {
        Self {
            descriptor: ActionDescriptor::new(
                "echo",
                "Echoes back the provided message, optionally repeating it.",
            )
            .with_parameter(ParameterSpec::required(
                "message",
                ParamType::String,
                "The message to echo back.",
            ))
            .with_parameter(
                ParameterSpec::optional(
                    "repeat",
                    ParamType::Integer,
                    "Number of times to repeat the message.",
                )
                .with_default(json!(1)),
            ),
        }
    }
}

impl Default for EchoAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for EchoAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &ActionContext, args: JsonMap) -> ArborResult<ActionResult> {
        ctx.check()?;
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ArborError::MissingParameter {
                action: "echo".to_string(),
                parameter: "message".to_string(),
            })?;
        let repeat = args
            .get("repeat")
            .and_then(|v| v.as_i64())
            .unwrap_or(1)
            .clamp(1, 100) as usize;

        let echoed = vec![message; repeat].join(" ");
        let mut result = JsonMap::new();
        result.insert("echo".to_string(), echoed.into());
        Ok(ActionResult::success(result))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn run(args: serde_json::Value) -> ActionResult {
        EchoAction::new()
            .execute(
                &ActionContext::new(Uuid::new_v4()),
                args.as_object().cloned().unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_echo_once() {
        let result = run(json!({"message": "hello"})).await;
        assert_eq!(result.result.unwrap()["echo"], "hello");
    }

    #[tokio::test]
    async fn test_echo_repeat() {
        let result = run(json!({"message": "hi", "repeat": 3})).await;
        assert_eq!(result.result.unwrap()["echo"], "hi hi hi");
    }

    #[tokio::test]
    async fn test_non_positive_repeat_clamped() {
        let result = run(json!({"message": "hi", "repeat": -2})).await;
        assert_eq!(result.result.unwrap()["echo"], "hi");
    }
}
