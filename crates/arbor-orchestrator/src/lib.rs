//! Event-driven orchestration loop for Arbor.
//!
//! The [`Orchestrator`] subscribes to the task lifecycle events on the bus
//! and moves every node of a run through its state machine: a READY node is
//! handed to a [`Planner`], which either binds it to an action or decomposes
//! it into an inner graph of subtasks. Actions run through the
//! [`ActionExecutor`](arbor_actions::ActionExecutor) under a concurrency
//! limit; completions propagate to dependents and up to owning nodes until
//! the root finishes and the run ends with `RunFinished`.
//!
//! # Main types
//!
//! - [`Orchestrator`]: The loop, from submission to shutdown.
//! - [`Planner`]: Decision seam, with [`StaticPlanner`] and [`LlmPlanner`].
//! - [`LanguageModel`] / [`InstrumentedModel`]: Model access with call events.
//! - [`RunHandle`] / [`RunReport`]: Waiting on and summarizing a run.
//! - [`GraphProjection`]: A task graph rebuilt from events alone.
//! - [`RunMonitor`]: Per-run model and action call counters.
//! - [`OrchestratorConfig`]: Topic, concurrency and failure policy.

/// Orchestrator and model configuration.
pub mod config;
/// The orchestration loop.
pub mod engine;
/// Language model seam and instrumentation.
pub mod llm;
/// Per-run call metrics.
pub mod monitor;
/// Planning decisions.
pub mod planner;
/// Event-sourced graph projection.
pub mod projection;
/// Run handles and reports.
pub mod run;

pub use config::{LlmConfig, OrchestratorConfig};
pub use engine::Orchestrator;
pub use llm::{InstrumentedModel, LanguageModel, LlmContext, LlmMessage, Role, ScriptedModel};
pub use monitor::{RunMetrics, RunMonitor};
pub use planner::{
    ActionCall, Decision, LlmPlanner, PlanContext, PlanSpec, Planner, StaticPlanner, Step,
};
pub use projection::GraphProjection;
pub use run::{RunHandle, RunReport};
