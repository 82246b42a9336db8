//! Event model and in-process event bus for Arbor.
//!
//! Every state change in a run is published as an [`Event`] on the
//! [`EventBus`]. The orchestration loop consumes lifecycle events to make
//! progress; observers (dashboards, the graph projection) subscribe to the
//! same stream.
//!
//! # Main types
//!
//! - [`Event`]: Immutable envelope with a typed [`EventPayload`].
//! - [`EventType`]: Closed set of event kinds with stable wire names.
//! - [`EventBus`]: Topic-based publish/subscribe with retry, panic recovery
//!   and correlation propagation.
//! - [`EventHandler`]: Subscriber contract; [`handler_fn`] adapts closures.
//! - [`BusConfig`]: Queue capacity, retry and shutdown tuning.

/// Topic-based publish/subscribe transport.
pub mod bus;
/// Bus configuration.
pub mod config;
/// Correlation id propagation across chained publishes.
pub mod correlation;
/// Event envelope, event types and wire format.
pub mod event;
/// Subscriber contract.
pub mod handler;
/// Delivery middleware (recovery, retry).
pub mod middleware;
/// Per-event-type payload structs.
pub mod payload;

pub use bus::{BusStats, EventBus, EventFilter, Message, SubscriptionId, TASK_TOPIC};
pub use config::BusConfig;
pub use event::{Event, EventType, WireEvent};
pub use handler::{handler_fn, Delivery, EventHandler, FnHandler};
pub use middleware::RetryPolicy;
pub use payload::EventPayload;
