//! Action registry and executor for Arbor.
//!
//! An action is a named, schema-described capability the orchestration loop
//! can invoke for a node. Actions are collected with an
//! [`ActionRegistryBuilder`], frozen into an immutable [`ActionRegistry`],
//! and dispatched by name through an [`ActionExecutor`] that validates
//! arguments, honours cancellation and normalizes every outcome into an
//! [`ActionResult`].
//!
//! # Main types
//!
//! - [`Action`]: Trait implemented by every action.
//! - [`ActionDescriptor`] / [`ParameterSpec`]: Introspectable schema.
//! - [`ActionRegistryBuilder`] / [`ActionRegistry`]: Registration and lookup.
//! - [`ActionExecutor`]: Validation, dispatch and sentinel fallback.
//! - [`ActionContext`]: Cancellation token and deadline of one invocation.

/// Action trait, schema and result types.
pub mod action;
/// Built-in actions.
pub mod builtins;
/// Validated, cancellable dispatch.
pub mod executor;
/// Registry builder and frozen registry.
pub mod registry;

pub use action::{
    truncate, Action, ActionContext, ActionDescriptor, ActionResult, ParamType, ParameterSpec,
};
pub use builtins::{EchoAction, FinishAction, InvalidAction, NoAction};
pub use executor::{ActionExecutor, ExecutionError};
pub use registry::{ActionRegistry, ActionRegistryBuilder};
