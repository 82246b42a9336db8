use super::{FINISH, INVALID_ACTION, NO_ACTION};
use crate::action::{Action, ActionContext, ActionDescriptor, ActionResult, ParamType, ParameterSpec};
use arbor_core::{ArborError, ArborResult, JsonMap};
use async_trait::async_trait;

/// Signals that the task is complete and carries the final answer.
pub struct FinishAction {
    descriptor: ActionDescriptor,
}

impl FinishAction {
    /// The `finish` sentinel.
    pub fn new() -> Self {
        Self {
            descriptor: ActionDescriptor::new(
                FINISH,
                "Signals that the task is complete and provides the final answer.",
            )
            .with_parameter(ParameterSpec::required(
                "final_answer",
                ParamType::String,
                "The final answer or result of the task.",
            )),
        }
    }
}

impl Default for FinishAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for FinishAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _ctx: &ActionContext, args: JsonMap) -> ArborResult<ActionResult> {
        let answer = args
            .get("final_answer")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ArborError::MissingParameter {
                action: FINISH.to_string(),
                parameter: "final_answer".to_string(),
            })?;
        let mut result = JsonMap::new();
        result.insert("final_answer".to_string(), answer.into());
        Ok(ActionResult::success(result))
    }
}

/// Stands in for an action that was requested but is not registered.
pub struct InvalidAction {
    descriptor: ActionDescriptor,
}

impl InvalidAction {
    /// The `invalid_action` sentinel.
    pub fn new() -> Self {
        Self {
            descriptor: ActionDescriptor::new(
                INVALID_ACTION,
                "Used when the requested action is not recognized or invalid.",
            )
            .with_parameter(ParameterSpec::optional(
                "reason",
                ParamType::String,
                "Reason why the action was considered invalid.",
            )),
        }
    }
}

impl Default for InvalidAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for InvalidAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _ctx: &ActionContext, args: JsonMap) -> ArborResult<ActionResult> {
        let reason = args
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("Invalid action requested.");
        Ok(ActionResult::error(reason))
    }
}

/// Stands in when no action was specified at all.
pub struct NoAction {
    descriptor: ActionDescriptor,
}

impl NoAction {
    /// The `no_action` sentinel.
    pub fn new() -> Self {
        Self {
            descriptor: ActionDescriptor::new(
                NO_ACTION,
                "Used when no action was specified where one was expected.",
            ),
        }
    }
}

impl Default for NoAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for NoAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _ctx: &ActionContext, _args: JsonMap) -> ArborResult<ActionResult> {
        Ok(ActionResult::error("No action was specified."))
    }
}
