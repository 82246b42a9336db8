use crate::config::LlmConfig;
use crate::monitor::RunMonitor;
use arbor_actions::truncate;
use arbor_core::{ArborError, ArborResult, NodeId, RunId};
use arbor_events::payload::{LlmCallCompleted, LlmCallStarted, TokenUsage};
use arbor_events::EventBus;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Speaker of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions framing the conversation.
    System,
    /// Input from the caller.
    User,
    /// Model output.
    Assistant,
}

/// One message of a model conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    /// Who is speaking.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Token accounting reported by the provider, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl LlmMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// An assistant reply.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            usage: None,
        }
    }

    /// Attach token usage.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Call context: who is asking, for which node, and how to cancel.
#[derive(Debug, Clone)]
pub struct LlmContext {
    /// Run the call belongs to.
    pub run_id: RunId,
    /// Node on whose behalf the call is made.
    pub node_id: Option<NodeId>,
    /// Component making the call, reported as `agent_class`.
    pub agent_class: String,
    /// Cancelled when the caller gives up.
    pub cancel: CancellationToken,
}

impl LlmContext {
    /// Context for `agent_class` within `run_id`.
    pub fn new(run_id: RunId, agent_class: impl Into<String>) -> Self {
        Self {
            run_id,
            node_id: None,
            agent_class: agent_class.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Attribute the call to a node.
    pub fn for_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Use `cancel` instead of a fresh token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The model boundary. Providers live outside this crate.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Answer a conversation with one assistant message.
    async fn generate(&self, ctx: &LlmContext, messages: &[LlmMessage]) -> ArborResult<LlmMessage>;

    /// Embed a text. Providers without embeddings keep the default.
    async fn generate_embedding(&self, _ctx: &LlmContext, _text: &str) -> ArborResult<Vec<f32>> {
        Err(ArborError::Llm("embeddings are not supported by this model".into()))
    }
}

/// Wraps a model, publishing `LLMCallStarted` / `LLMCallCompleted` around
/// every call and feeding the [`RunMonitor`].
///
/// Calls abort with [`ArborError::Cancelled`] when the context is cancelled.
pub struct InstrumentedModel {
    inner: Arc<dyn LanguageModel>,
    bus: EventBus,
    topic: String,
    source_service: String,
    config: LlmConfig,
    monitor: Option<RunMonitor>,
}

impl InstrumentedModel {
    /// Wrap `inner`, publishing call events on `topic`.
    pub fn new(
        inner: Arc<dyn LanguageModel>,
        bus: EventBus,
        topic: impl Into<String>,
        source_service: impl Into<String>,
        config: LlmConfig,
    ) -> Self {
        Self {
            inner,
            bus,
            topic: topic.into(),
            source_service: source_service.into(),
            config,
            monitor: None,
        }
    }

    /// Record call counts and tokens in `monitor`.
    pub fn with_monitor(mut self, monitor: RunMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn preview(&self, messages: &[LlmMessage]) -> String {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .or_else(|| messages.last())
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        truncate(prompt, self.config.prompt_preview_chars)
    }

    async fn publish(&self, run_id: RunId, payload: impl Into<arbor_events::EventPayload>) {
        if let Err(e) = self
            .bus
            .emit(&self.topic, &self.source_service, run_id, payload)
            .await
        {
            warn!(error = %e, "Failed to publish LLM call event");
        }
    }
}

#[async_trait]
impl LanguageModel for InstrumentedModel {
    async fn generate(&self, ctx: &LlmContext, messages: &[LlmMessage]) -> ArborResult<LlmMessage> {
        self.publish(
            ctx.run_id,
            LlmCallStarted {
                node_id: ctx.node_id,
                agent_class: ctx.agent_class.clone(),
                model: self.config.model.clone(),
                prompt_preview: self.preview(messages),
            },
        )
        .await;

        let start = Instant::now();
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ArborError::Cancelled("model call cancelled".into())),
            reply = self.inner.generate(ctx, messages) => reply,
        };
        let elapsed = start.elapsed();

        let (token_usage, response_preview, error) = match &outcome {
            Ok(reply) => (
                reply.usage,
                Some(truncate(&reply.content, self.config.prompt_preview_chars)),
                None,
            ),
            Err(e) => (None, None, Some(e.to_string())),
        };
        debug!(
            agent_class = %ctx.agent_class,
            model = %self.config.model,
            duration_ms = elapsed.as_millis() as u64,
            ok = outcome.is_ok(),
            "Model call finished"
        );
        if let Some(monitor) = &self.monitor {
            monitor
                .record_llm_call(
                    ctx.run_id,
                    elapsed,
                    token_usage.map(|u| u.total_tokens),
                    error.is_some(),
                )
                .await;
        }
        self.publish(
            ctx.run_id,
            LlmCallCompleted {
                node_id: ctx.node_id,
                agent_class: ctx.agent_class.clone(),
                model: self.config.model.clone(),
                duration_seconds: elapsed.as_secs_f64(),
                token_usage,
                response_preview,
                error,
            },
        )
        .await;
        outcome
    }

    async fn generate_embedding(&self, ctx: &LlmContext, text: &str) -> ArborResult<Vec<f32>> {
        self.inner.generate_embedding(ctx, text).await
    }
}

/// A model that replays canned replies in order, for offline runs and tests.
///
/// Once the script is exhausted every call fails with [`ArborError::Llm`].
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ArborResult<String>>>,
    prompts: Mutex<Vec<Vec<LlmMessage>>>,
}

impl ScriptedModel {
    /// A model that answers with `replies` in order.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failing reply.
    pub fn push_error(&self, error: ArborError) {
        self.replies.lock().push_back(Err(error));
    }

    /// Conversations received so far.
    pub fn prompts(&self) -> Vec<Vec<LlmMessage>> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, _ctx: &LlmContext, messages: &[LlmMessage]) -> ArborResult<LlmMessage> {
        self.prompts.lock().push(messages.to_vec());
        let next = self.replies.lock().pop_front();
        match next {
            Some(Ok(content)) => Ok(LlmMessage::assistant(content)),
            Some(Err(e)) => Err(e),
            None => Err(ArborError::Llm("script exhausted".into())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use arbor_events::{handler_fn, BusConfig, Delivery, Event, EventType};
    use std::time::Duration;
    use uuid::Uuid;

    async fn collect(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_all(
            "tasks",
            handler_fn(move |d: Delivery| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(d.event);
                    Ok::<(), ArborError>(())
                }
            }),
        )
        .unwrap();
        seen
    }

    fn instrumented(bus: &EventBus, inner: Arc<dyn LanguageModel>) -> InstrumentedModel {
        InstrumentedModel::new(
            inner,
            bus.clone(),
            "tasks",
            "test",
            LlmConfig {
                model: "scripted".into(),
                prompt_preview_chars: 8,
            },
        )
    }

    #[tokio::test]
    async fn test_scripted_model_replays_then_fails() {
        let model = ScriptedModel::new(["one"]);
        let ctx = LlmContext::new(Uuid::new_v4(), "test");
        let reply = model.generate(&ctx, &[LlmMessage::user("hi")]).await.unwrap();
        assert_eq!(reply.content, "one");
        assert_eq!(reply.role, Role::Assistant);
        assert!(model.generate(&ctx, &[]).await.is_err());
        assert_eq!(model.prompts().len(), 2);
        assert!(model.generate_embedding(&ctx, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_instrumented_emits_start_and_completion() {
        let bus = EventBus::new(BusConfig::default()).unwrap();
        let seen = collect(&bus).await;
        let monitor = RunMonitor::new();
        let model = instrumented(&bus, Arc::new(ScriptedModel::new(["a long answer"])))
            .with_monitor(monitor.clone());
        let run = Uuid::new_v4();
        let node = Uuid::new_v4();
        monitor.begin(run).await;
        let ctx = LlmContext::new(run, "planner").for_node(node);

        model
            .generate(
                &ctx,
                &[LlmMessage::system("rules"), LlmMessage::user("please plan this")],
            )
            .await
            .unwrap();
        bus.close().await.unwrap();

        let events = seen.lock().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), EventType::LlmCallStarted);
        assert_eq!(events[0].run_id, run);
        let json: serde_json::Value = serde_json::from_str(&events[0].to_json().unwrap()).unwrap();
        assert_eq!(json["event_type"], "LLMCallStarted");
        assert_eq!(json["payload"]["prompt_preview"], "pleas...");
        assert_eq!(json["payload"]["node_id"], node.to_string());
        assert_eq!(events[1].event_type(), EventType::LlmCallCompleted);
        assert_eq!(monitor.get(run).await.llm_calls, 1);
    }

    #[tokio::test]
    async fn test_instrumented_reports_errors() {
        let bus = EventBus::new(BusConfig::default()).unwrap();
        let seen = collect(&bus).await;
        let model = instrumented(&bus, Arc::new(ScriptedModel::new(Vec::<String>::new())));
        let ctx = LlmContext::new(Uuid::new_v4(), "planner");
        assert!(model.generate(&ctx, &[LlmMessage::user("x")]).await.is_err());
        bus.close().await.unwrap();

        let events = seen.lock().clone();
        let json: serde_json::Value = serde_json::from_str(&events[1].to_json().unwrap()).unwrap();
        assert!(json["payload"]["error"].as_str().unwrap().contains("exhausted"));
    }

    struct Hanging;

    #[async_trait]
    impl LanguageModel for Hanging {
        async fn generate(&self, _ctx: &LlmContext, _m: &[LlmMessage]) -> ArborResult<LlmMessage> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(LlmMessage::assistant("late"))
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_call() {
        let bus = EventBus::new(BusConfig::default()).unwrap();
        let model = instrumented(&bus, Arc::new(Hanging));
        let ctx = LlmContext::new(Uuid::new_v4(), "planner");
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = model.generate(&ctx, &[]).await.unwrap_err();
        assert!(matches!(err, ArborError::Cancelled(_)));
    }
}
