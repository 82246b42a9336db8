use arbor_core::{ArborResult, NodeId, NodeStatus, RunId};
use arbor_events::{Delivery, Event, EventBus, EventHandler, EventPayload, SubscriptionId};
use arbor_graph::{Edge, GraphSnapshot, Node, NodeError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// A task graph rebuilt purely from events.
///
/// Subscribes to every event on a topic and replays `TaskSubmitted`,
/// `NodeStatusChanged`, `EdgeAdded`, `TaskCompleted` and `TaskFailed` into
/// its own copy of the graph. Observers use it to follow a run without
/// access to the orchestrator; once a run has finished, its snapshot matches
/// the orchestrator's graph.
#[derive(Clone, Default)]
pub struct GraphProjection {
    state: Arc<RwLock<Projected>>,
}

#[derive(Default)]
struct Projected {
    nodes: HashMap<NodeId, Node>,
    order: Vec<NodeId>,
    edges: Vec<Edge>,
    edge_set: HashSet<(NodeId, NodeId)>,
    finished: HashSet<RunId>,
    /// Event ids applied so far, per unfinished run.
    seen: HashMap<RunId, HashSet<uuid::Uuid>>,
}

impl GraphProjection {
    /// An empty projection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a projection fed by every event on `topic`.
    pub fn attach(bus: &EventBus, topic: &str) -> ArborResult<(Self, SubscriptionId)> {
        let projection = Self::new();
        let id = bus.subscribe_all(topic, projection.clone())?;
        Ok((projection, id))
    }

    /// Fold one event into the projection. Replays, and events arriving
    /// after their run's `RunFinished`, are ignored.
    pub fn apply(&self, event: &Event) {
        let mut state = self.state.write();
        if state.finished.contains(&event.run_id)
            || !state
                .seen
                .entry(event.run_id)
                .or_default()
                .insert(event.event_id)
        {
            return;
        }
        match &event.payload {
            EventPayload::TaskSubmitted(p) => {
                if state.nodes.contains_key(&p.node_id) {
                    return;
                }
                state.order.push(p.node_id);
                state.nodes.insert(
                    p.node_id,
                    Node {
                        node_id: p.node_id,
                        node_nid: p.node_nid.clone(),
                        node_type: p.node_type,
                        task_type: p.task_type.clone(),
                        goal: p.goal.clone(),
                        layer: p.layer,
                        outer_node_id: p.outer_node_id,
                        root_node_id: p.root_node_id,
                        status: NodeStatus::NotReady,
                        metadata: p.metadata.clone(),
                        result: None,
                        error: None,
                        created_at: event.timestamp,
                        updated_at: event.timestamp,
                    },
                );
            }
            EventPayload::NodeStatusChanged(p) => match state.nodes.get_mut(&p.node_id) {
                Some(node) => {
                    if node.status != p.old_status {
                        debug!(node_id = %p.node_id, expected = %p.old_status, actual = %node.status, "Projection out of step");
                    }
                    node.status = p.new_status;
                    node.updated_at = event.timestamp;
                }
                None => warn!(node_id = %p.node_id, "Status change for a node never submitted"),
            },
            EventPayload::EdgeAdded(p) => {
                if state.edge_set.insert((p.parent_node_id, p.child_node_id)) {
                    state.edges.push(Edge {
                        parent_node_id: p.parent_node_id,
                        child_node_id: p.child_node_id,
                        graph_owner_node_id: p.graph_owner_node_id,
                    });
                }
            }
            EventPayload::TaskCompleted(p) => {
                if let Some(node) = state.nodes.get_mut(&p.node_id) {
                    node.result.get_or_insert_with(|| p.result.clone());
                }
            }
            EventPayload::TaskFailed(p) => {
                if let Some(node) = state.nodes.get_mut(&p.node_id) {
                    node.error.get_or_insert_with(|| NodeError {
                        error_type: p.error_type.clone(),
                        message: p.error_info.clone(),
                    });
                }
            }
            EventPayload::RunFinished(_) => {
                state.finished.insert(event.run_id);
                state.seen.remove(&event.run_id);
            }
            _ => {}
        }
    }

    /// Whether `RunFinished` was seen for `run_id`.
    pub fn is_finished(&self, run_id: RunId) -> bool {
        self.state.read().finished.contains(&run_id)
    }

    /// Drop a finished run's nodes and edges. Returns how many nodes were
    /// removed.
    pub fn forget(&self, run_id: RunId, root: NodeId) -> usize {
        let mut state = self.state.write();
        let Projected {
            nodes,
            order,
            edges,
            edge_set,
            finished,
            seen,
        } = &mut *state;
        let before = nodes.len();
        nodes.retain(|_, n| n.root_node_id != root);
        order.retain(|id| nodes.contains_key(id));
        edges.retain(|e| nodes.contains_key(&e.child_node_id));
        edge_set.retain(|(_, child)| nodes.contains_key(child));
        finished.remove(&run_id);
        seen.remove(&run_id);
        before - nodes.len()
    }

    /// Number of projected nodes.
    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Whether no node has been projected.
    pub fn is_empty(&self) -> bool {
        self.state.read().nodes.is_empty()
    }

    /// A projected node.
    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.state.read().nodes.get(&id).cloned()
    }

    /// Everything projected so far.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.snapshot_filtered(|_| true)
    }

    /// The nodes and edges of one run.
    pub fn snapshot_run(&self, root: NodeId) -> GraphSnapshot {
        self.snapshot_filtered(|n| n.root_node_id == root)
    }

    fn snapshot_filtered(&self, keep: impl Fn(&Node) -> bool) -> GraphSnapshot {
        let state = self.state.read();
        let nodes: Vec<Node> = state
            .order
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| keep(n))
            .cloned()
            .collect();
        let members: HashSet<NodeId> = nodes.iter().map(|n| n.node_id).collect();
        let edges = state
            .edges
            .iter()
            .filter(|e| members.contains(&e.child_node_id))
            .copied()
            .collect();
        GraphSnapshot { nodes, edges }
    }
}

#[async_trait]
impl EventHandler for GraphProjection {
    async fn handle(&self, delivery: Delivery) -> ArborResult<()> {
        self.apply(&delivery.event);
        Ok(())
    }
}
