//! Hierarchical task graph for Arbor.
//!
//! A run is a tree of scopes: the root node may be decomposed into an inner
//! graph of children, each of which may be decomposed again. Within a scope,
//! edges record which siblings must complete before another may start.
//! Status changes are checked against the node state machine.
//!
//! # Main types
//!
//! - [`TaskGraph`]: The thread-safe graph store and its queries.
//! - [`Node`] / [`NewNode`]: A stored task and the input that creates one.
//! - [`Edge`]: A dependency within one scope.
//! - [`Transition`]: A status change that was applied.
//! - [`GraphSnapshot`]: Serializable point-in-time copy.

/// Cycle detection over dependency maps.
pub mod cycle;
/// The graph store.
pub mod graph;
/// Node, edge and change records.
pub mod node;
/// Serializable snapshots.
pub mod snapshot;

pub use cycle::has_cycle;
pub use graph::TaskGraph;
pub use node::{ChildPlan, Edge, Expansion, NewNode, Node, NodeError, Transition};
pub use snapshot::GraphSnapshot;
