use arbor_core::{JsonMap, NodeId, NodeStatus, NodeType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error recorded on a node when it fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    /// Stable error class tag.
    pub error_type: String,
    /// Human-readable message.
    pub message: String,
}

/// A task in the graph.
///
/// Everything except `status`, and the one-time `result`/`error`, is fixed
/// at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique id.
    pub node_id: NodeId,
    /// Path id: the root is "0", the k-th child of "x" is "x.k".
    pub node_nid: String,
    /// Plan or execute.
    pub node_type: NodeType,
    /// Free-form task category.
    pub task_type: String,
    /// What the node should achieve.
    pub goal: String,
    /// Depth in the decomposition.
    pub layer: u32,
    /// Owning composite node.
    pub outer_node_id: Option<NodeId>,
    /// Root of the run.
    pub root_node_id: NodeId,
    /// Current status.
    pub status: NodeStatus,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: JsonMap,
    /// Outputs, set on completion.
    #[serde(default)]
    pub result: Option<JsonMap>,
    /// Error, set on failure.
    #[serde(default)]
    pub error: Option<NodeError>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last status change.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Whether the node is the root of its run.
    pub fn is_root(&self) -> bool {
        self.outer_node_id.is_none()
    }
}

/// What a caller supplies to create a node; placement fields are derived.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    /// Id to assign. Must be unused.
    pub node_id: NodeId,
    /// Plan or execute.
    pub node_type: NodeType,
    /// Free-form task category.
    pub task_type: String,
    /// What the node should achieve.
    pub goal: String,
    /// Free-form metadata.
    pub metadata: JsonMap,
}

impl NewNode {
    /// A node with a fresh id and no metadata.
    pub fn new(goal: impl Into<String>, task_type: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            node_type,
            task_type: task_type.into(),
            goal: goal.into(),
            metadata: JsonMap::new(),
        }
    }

    /// Use a caller-chosen id.
    pub fn with_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A child of a decomposition together with its sibling dependencies.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildPlan {
    /// The child to create.
    pub node: NewNode,
    /// Siblings (by id) that must complete first.
    pub dependencies: Vec<NodeId>,
}

/// A dependency edge: `child` waits for `parent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Dependency source.
    pub parent_node_id: NodeId,
    /// Dependent node.
    pub child_node_id: NodeId,
    /// Owner of the scope holding both endpoints; `None` for the top level.
    pub graph_owner_node_id: Option<NodeId>,
}

impl Edge {
    /// Edge identity within its scope, rendered "parent->child".
    pub fn edge_id(&self) -> String {
        format!("{}->{}", self.parent_node_id, self.child_node_id)
    }
}

/// A status change that was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Node that changed.
    pub node_id: NodeId,
    /// Path id of the node.
    pub node_nid: String,
    /// Goal of the node.
    pub goal: String,
    /// Task category of the node.
    pub task_type: String,
    /// Status before.
    pub from: NodeStatus,
    /// Status after.
    pub to: NodeStatus,
}

impl Transition {
    pub(crate) fn of(node: &Node, from: NodeStatus) -> Self {
        Self {
            node_id: node.node_id,
            node_nid: node.node_nid.clone(),
            goal: node.goal.clone(),
            task_type: node.task_type.clone(),
            from,
            to: node.status,
        }
    }
}

/// Nodes and edges materialized by one decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    /// Composite node owning the new scope.
    pub owner: Node,
    /// New children, in plan order.
    pub nodes: Vec<Node>,
    /// New edges, in plan order.
    pub edges: Vec<Edge>,
}
