use crate::action::{json_type_name, ActionContext, ActionResult};
use crate::builtins::{INVALID_ACTION, NO_ACTION};
use crate::registry::ActionRegistry;
use arbor_core::{ArborError, JsonMap};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An action invocation that did not produce a normal result.
///
/// `result` is always a populated, error-status [`ActionResult`] the caller
/// can record; `source` keeps the original error.
#[derive(Debug, thiserror::Error)]
#[error("failed to execute action '{action_name}': {source}")]
pub struct ExecutionError {
    /// Action that was requested.
    pub action_name: String,
    /// Normalized result to record for the invocation.
    pub result: ActionResult,
    /// What went wrong.
    pub source: ArborError,
}

impl ExecutionError {
    fn new(action_name: &str, source: ArborError) -> Self {
        let result = ActionResult::error(format!(
            "Error executing action '{action_name}': {source}"
        ));
        Self {
            action_name: action_name.to_string(),
            result,
            source,
        }
    }
}

/// Dispatches invocations by name against an immutable registry.
#[derive(Clone)]
pub struct ActionExecutor {
    registry: Arc<ActionRegistry>,
}

impl ActionExecutor {
    /// Executor over a built registry.
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        info!(action_count = registry.len(), "Action executor initialized");
        Self { registry }
    }

    /// The registry this executor dispatches against.
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Catalog text for planning prompts.
    pub fn render_catalog(&self) -> String {
        self.registry.render_catalog()
    }

    /// Validate `args` and run the named action.
    ///
    /// Unknown names, missing required arguments, type mismatches,
    /// cancellation, action errors and action panics all come back as an
    /// [`ExecutionError`] carrying an error-status result.
    pub async fn execute(
        &self,
        ctx: &ActionContext,
        action_name: &str,
        args: JsonMap,
    ) -> Result<ActionResult, ExecutionError> {
        let action = match self.registry.get(action_name) {
            Ok(action) => action.clone(),
            Err(e) => {
                warn!(action = %action_name, "Attempted to execute unknown action");
                return Err(ExecutionError::new(action_name, e));
            }
        };
        ctx.check()
            .map_err(|e| ExecutionError::new(action_name, e))?;
        let args = self
            .validate(action_name, args)
            .map_err(|e| ExecutionError::new(action_name, e))?;

        debug!(action = %action_name, node_id = ?ctx.node_id, "Executing action");
        let invocation = AssertUnwindSafe(action.execute(ctx, args)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            reason = ctx.interrupted() => Err(reason),
            joined = invocation => joined.unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(ArborError::Action(format!("action panicked: {message}")))
            }),
        };

        match outcome {
            Ok(result) => {
                let result = result.normalized(action_name);
                info!(action = %action_name, status = %result.status, "Action execution completed");
                Ok(result)
            }
            Err(e) => {
                error!(action = %action_name, error = %e, "Action execution failed");
                Err(ExecutionError::new(action_name, e))
            }
        }
    }

    /// Run the named action, substituting sentinel actions where needed.
    ///
    /// No name runs `no_action`; an unregistered name runs `invalid_action`
    /// with a reason. Execution errors are flattened into their result, so
    /// this always yields a result with a status.
    pub async fn execute_or_fallback(
        &self,
        ctx: &ActionContext,
        action_name: Option<&str>,
        args: JsonMap,
    ) -> ActionResult {
        let requested = action_name.map(str::trim).filter(|n| !n.is_empty());
        let (name, args) = match requested {
            None => (NO_ACTION, JsonMap::new()),
            Some(name) if !self.registry.contains(name) => {
                let mut reason = JsonMap::new();
                reason.insert(
                    "reason".to_string(),
                    format!("Action '{name}' is not registered").into(),
                );
                (INVALID_ACTION, reason)
            }
            Some(name) => (name, args),
        };
        match self.execute(ctx, name, args).await {
            Ok(result) => result,
            Err(e) => e.result,
        }
    }

    /// Check required arguments and types; fill defaults for absent optionals.
    fn validate(&self, action_name: &str, mut args: JsonMap) -> Result<JsonMap, ArborError> {
        let descriptor = self.registry.get(action_name)?.descriptor();
        for param in &descriptor.parameters {
            match args.get(&param.name) {
                Some(value) if value.is_null() && !param.required => {
                    args.remove(&param.name);
                }
                Some(value) => {
                    if !param.param_type.accepts(value) {
                        return Err(ArborError::InvalidParameter {
                            action: action_name.to_string(),
                            parameter: param.name.clone(),
                            expected: param.param_type.to_string(),
                            actual: json_type_name(value).to_string(),
                        });
                    }
                    continue;
                }
                None if param.required => {
                    return Err(ArborError::MissingParameter {
                        action: action_name.to_string(),
                        parameter: param.name.clone(),
                    });
                }
                None => {}
            }
            if let Some(default) = &param.default {
                args.insert(param.name.clone(), default.clone());
            }
        }
        for key in args.keys() {
            if descriptor.parameter(key).is_none() {
                debug!(action = %action_name, argument = %key, "Ignoring undeclared argument");
            }
        }
        Ok(args)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionDescriptor};
    use crate::builtins::EchoAction;
    use arbor_core::{ActionStatus, ArborResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn args(value: serde_json::Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    struct SlowAction {
        descriptor: ActionDescriptor,
    }

    #[async_trait]
    impl Action for SlowAction {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.descriptor
        }

        async fn execute(&self, _ctx: &ActionContext, _args: JsonMap) -> ArborResult<ActionResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ActionResult::success(JsonMap::new()))
        }
    }

    struct PanickyAction {
        descriptor: ActionDescriptor,
    }

    #[async_trait]
    impl Action for PanickyAction {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.descriptor
        }

        async fn execute(&self, _ctx: &ActionContext, _args: JsonMap) -> ArborResult<ActionResult> {
            panic!("bad action");
        }
    }

    fn executor() -> ActionExecutor {
        let registry = ActionRegistry::builder()
            .register(Arc::new(EchoAction::new()))
            .unwrap()
            .register(Arc::new(SlowAction {
                descriptor: ActionDescriptor::new("slow", "Sleeps"),
            }))
            .unwrap()
            .register(Arc::new(PanickyAction {
                descriptor: ActionDescriptor::new("panicky", "Panics"),
            }))
            .unwrap()
            .build();
        ActionExecutor::new(Arc::new(registry))
    }

    fn ctx() -> ActionContext {
        ActionContext::new(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_finish_success() {
        let result = executor()
            .execute(&ctx(), "finish", args(json!({"final_answer": "42"})))
            .await
            .unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        assert_eq!(result.result.unwrap()["final_answer"], "42");
    }

    #[tokio::test]
    async fn test_finish_missing_argument() {
        let err = executor()
            .execute(&ctx(), "finish", JsonMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.result.status, ActionStatus::Error);
        assert!(err.result.error.is_some());
        assert!(matches!(err.source, ArborError::MissingParameter { .. }));
        assert!(err.to_string().starts_with("failed to execute action 'finish'"));
    }

    #[tokio::test]
    async fn test_type_mismatch() {
        let err = executor()
            .execute(&ctx(), "echo", args(json!({"message": 5})))
            .await
            .unwrap_err();
        match err.source {
            ArborError::InvalidParameter {
                parameter,
                expected,
                actual,
                ..
            } => {
                assert_eq!(parameter, "message");
                assert_eq!(expected, "string");
                assert_eq!(actual, "integer");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_default_applied() {
        let result = executor()
            .execute(&ctx(), "echo", args(json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(result.result.unwrap()["echo"], "hi");
    }

    #[tokio::test]
    async fn test_null_optional_uses_default() {
        let result = executor()
            .execute(&ctx(), "echo", args(json!({"message": "hi", "repeat": null})))
            .await
            .unwrap();
        assert_eq!(result.result.unwrap()["echo"], "hi");
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let err = executor()
            .execute(&ctx(), "teleport", JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err.source, ArborError::ActionNotFound(_)));
        assert_eq!(err.result.status, ActionStatus::Error);
    }

    #[tokio::test]
    async fn test_fallback_for_unknown_and_missing_names() {
        let exec = executor();
        let invalid = exec
            .execute_or_fallback(&ctx(), Some("teleport"), JsonMap::new())
            .await;
        assert_eq!(invalid.status, ActionStatus::Error);
        assert!(invalid.error.unwrap().contains("teleport"));

        let none = exec.execute_or_fallback(&ctx(), None, JsonMap::new()).await;
        assert_eq!(none.status, ActionStatus::Error);
        let blank = exec.execute_or_fallback(&ctx(), Some("  "), JsonMap::new()).await;
        assert_eq!(blank, none);
    }

    #[tokio::test]
    async fn test_fallback_flattens_validation_errors() {
        let result = executor()
            .execute_or_fallback(&ctx(), Some("finish"), JsonMap::new())
            .await;
        assert_eq!(result.status, ActionStatus::Error);
        assert!(result.error.unwrap().contains("final_answer"));
    }

    #[tokio::test]
    async fn test_timeout_cancels_promptly() {
        let ctx = ctx().with_timeout(Duration::from_millis(20));
        let started = tokio::time::Instant::now();
        let err = executor()
            .execute(&ctx, "slow", JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err.source, ArborError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_token_aborts() {
        let ctx = ctx();
        let token = ctx.cancel.clone();
        let exec = executor();
        let handle = tokio::spawn(async move { exec.execute(&ctx, "slow", JsonMap::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err.source, ArborError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_already_cancelled_context() {
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = executor()
            .execute(&ctx, "finish", args(json!({"final_answer": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err.source, ArborError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_action_panic_is_contained() {
        let err = executor()
            .execute(&ctx(), "panicky", JsonMap::new())
            .await
            .unwrap_err();
        assert!(err.source.to_string().contains("bad action"));
        assert_eq!(err.result.status, ActionStatus::Error);
    }
}
