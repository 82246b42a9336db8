use crate::cycle::has_cycle;
use crate::node::{ChildPlan, Edge, Expansion, NewNode, Node, NodeError, Transition};
use crate::snapshot::GraphSnapshot;
use arbor_core::{ArborError, ArborResult, JsonMap, NodeId, NodeStatus};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::debug;

/// The hierarchical task graph of one or more runs.
///
/// Nodes live in an id-keyed arena. Every node belongs to exactly one scope:
/// the top level (roots) or the inner graph of its `outer_node_id`. Edges
/// connect two nodes of the same scope and are never removed.
///
/// Writes are serialized behind a `parking_lot::RwLock`; reads run
/// concurrently. The lock is never held across an `.await`.
pub struct TaskGraph {
    state: RwLock<GraphState>,
}

#[derive(Default)]
struct GraphState {
    nodes: HashMap<NodeId, Node>,
    order: Vec<NodeId>,
    scopes: HashMap<Option<NodeId>, Vec<NodeId>>,
    edges: Vec<Edge>,
    edge_set: HashSet<(NodeId, NodeId)>,
    dependencies: HashMap<NodeId, Vec<NodeId>>,
    dependents: HashMap<NodeId, Vec<NodeId>>,
}

impl GraphState {
    fn node(&self, id: NodeId) -> ArborResult<&Node> {
        self.nodes.get(&id).ok_or(ArborError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> ArborResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(ArborError::NodeNotFound(id))
    }

    fn inner(&self, owner: NodeId) -> &[NodeId] {
        self.scopes.get(&Some(owner)).map_or(&[], Vec::as_slice)
    }

    fn deps_satisfied(&self, id: NodeId) -> bool {
        self.dependencies.get(&id).map_or(true, |deps| {
            deps.iter().all(|d| {
                self.nodes
                    .get(d)
                    .is_some_and(|n| n.status == NodeStatus::Completed)
            })
        })
    }

    /// Whether `from` transitively depends on `target`.
    fn depends_on(&self, from: NodeId, target: NodeId) -> bool {
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                if let Some(deps) = self.dependencies.get(&id) {
                    queue.extend(deps.iter().copied());
                }
            }
        }
        false
    }

    fn insert(&mut self, node: Node) {
        let id = node.node_id;
        self.scopes.entry(node.outer_node_id).or_default().push(id);
        self.order.push(id);
        self.nodes.insert(id, node);
    }

    fn make_child(&self, owner: NodeId, spec: NewNode, ordinal: usize) -> ArborResult<Node> {
        if self.nodes.contains_key(&spec.node_id) {
            return Err(ArborError::Graph(format!(
                "node {} already exists",
                spec.node_id
            )));
        }
        let outer = self.node(owner)?;
        let now = Utc::now();
        Ok(Node {
            node_id: spec.node_id,
            node_nid: format!("{}.{}", outer.node_nid, ordinal),
            node_type: spec.node_type,
            task_type: spec.task_type,
            goal: spec.goal,
            layer: outer.layer + 1,
            outer_node_id: Some(owner),
            root_node_id: outer.root_node_id,
            status: NodeStatus::NotReady,
            metadata: spec.metadata,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn add_edge(&mut self, parent: NodeId, child: NodeId) -> ArborResult<Option<Edge>> {
        if parent == child {
            return Err(ArborError::Graph(format!("node {parent} cannot depend on itself")));
        }
        let p = self.node(parent)?;
        let c = self.node(child)?;
        if p.outer_node_id != c.outer_node_id || p.root_node_id != c.root_node_id {
            return Err(ArborError::Graph(format!(
                "edge {parent}->{child} crosses graph scopes"
            )));
        }
        let owner = c.outer_node_id;
        if self.edge_set.contains(&(parent, child)) {
            return Ok(None);
        }
        if self.depends_on(parent, child) {
            return Err(ArborError::Graph(format!(
                "edge {parent}->{child} would create a dependency cycle"
            )));
        }
        let edge = Edge {
            parent_node_id: parent,
            child_node_id: child,
            graph_owner_node_id: owner,
        };
        self.edge_set.insert((parent, child));
        self.edges.push(edge);
        self.dependencies.entry(child).or_default().push(parent);
        self.dependents.entry(parent).or_default().push(child);
        Ok(Some(edge))
    }

    fn transition(&mut self, id: NodeId, to: NodeStatus) -> ArborResult<Option<Transition>> {
        let satisfied = self.deps_satisfied(id);
        let node = self.node_mut(id)?;
        let from = node.status;
        if from == to {
            return Ok(None);
        }
        if !from.can_transition_to(to) {
            return Err(ArborError::IllegalTransition {
                node_id: id,
                from,
                to,
            });
        }
        if to == NodeStatus::Ready && !satisfied {
            return Err(ArborError::Graph(format!(
                "node {id} cannot become READY before its dependencies complete"
            )));
        }
        node.status = to;
        node.updated_at = Utc::now();
        debug!(node_id = %id, nid = %node.node_nid, from = %from, to = %to, "Node status changed");
        Ok(Some(Transition::of(node, from)))
    }
}

impl TaskGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
        }
    }

    // --- Construction ---

    /// Create the root node of a new run. Its nid is "0".
    pub fn add_root(&self, spec: NewNode) -> ArborResult<Node> {
        let mut state = self.state.write();
        if state.nodes.contains_key(&spec.node_id) {
            return Err(ArborError::Graph(format!(
                "node {} already exists",
                spec.node_id
            )));
        }
        let now = Utc::now();
        let node = Node {
            node_id: spec.node_id,
            node_nid: "0".to_string(),
            node_type: spec.node_type,
            task_type: spec.task_type,
            goal: spec.goal,
            layer: 0,
            outer_node_id: None,
            root_node_id: spec.node_id,
            status: NodeStatus::NotReady,
            metadata: spec.metadata,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        state.insert(node.clone());
        Ok(node)
    }

    /// Create a child in the inner graph of `owner`.
    pub fn add_child(&self, owner: NodeId, spec: NewNode) -> ArborResult<Node> {
        let mut state = self.state.write();
        let ordinal = state.inner(owner).len() + 1;
        let node = state.make_child(owner, spec, ordinal)?;
        state.insert(node.clone());
        Ok(node)
    }

    /// Record that `child` depends on `parent`.
    ///
    /// Both must be in the same scope. Returns `None` when the edge already
    /// exists. Edges that would close a dependency cycle are rejected.
    pub fn add_edge(&self, parent: NodeId, child: NodeId) -> ArborResult<Option<Edge>> {
        self.state.write().add_edge(parent, child)
    }

    /// Materialize a decomposition of `owner` atomically.
    ///
    /// The whole plan is validated first: `owner` must exist, be live and not
    /// yet decomposed; child ids must be fresh and distinct; dependencies
    /// must name siblings and be acyclic. On any violation nothing is added.
    pub fn expand(&self, owner: NodeId, children: Vec<ChildPlan>) -> ArborResult<Expansion> {
        let mut state = self.state.write();
        let outer = state.node(owner)?;
        if outer.status.is_terminal() {
            return Err(ArborError::Graph(format!(
                "cannot decompose node {owner} in terminal status {}",
                outer.status
            )));
        }
        if !state.inner(owner).is_empty() {
            return Err(ArborError::Graph(format!("node {owner} is already decomposed")));
        }

        let mut siblings = HashSet::new();
        for child in &children {
            if state.nodes.contains_key(&child.node.node_id) || !siblings.insert(child.node.node_id) {
                return Err(ArborError::Graph(format!(
                    "duplicate node id {} in decomposition of {owner}",
                    child.node.node_id
                )));
            }
        }
        let mut plan_deps = HashMap::new();
        for child in &children {
            for dep in &child.dependencies {
                if !siblings.contains(dep) {
                    return Err(ArborError::Graph(format!(
                        "node {} depends on {dep}, which is not a sibling",
                        child.node.node_id
                    )));
                }
            }
            plan_deps.insert(child.node.node_id, child.dependencies.clone());
        }
        if has_cycle(&plan_deps) {
            return Err(ArborError::Graph(format!(
                "decomposition of {owner} has a dependency cycle"
            )));
        }

        let mut nodes = Vec::with_capacity(children.len());
        let mut wiring = Vec::with_capacity(children.len());
        for (i, child) in children.into_iter().enumerate() {
            let node = state.make_child(owner, child.node, i + 1)?;
            wiring.push((node.node_id, child.dependencies));
            state.insert(node.clone());
            nodes.push(node);
        }
        let mut edges = Vec::new();
        for (child, deps) in wiring {
            for dep in deps {
                if let Some(edge) = state.add_edge(dep, child)? {
                    edges.push(edge);
                }
            }
        }
        let owner = state.node(owner)?.clone();
        Ok(Expansion {
            owner,
            nodes,
            edges,
        })
    }

    // --- Status ---

    /// Apply a status change.
    ///
    /// Returns `None` when the node is already in `to` (redelivery), and
    /// [`ArborError::IllegalTransition`] for a change the state machine does
    /// not allow. Moving to READY also requires all dependencies completed.
    pub fn transition(&self, id: NodeId, to: NodeStatus) -> ArborResult<Option<Transition>> {
        self.state.write().transition(id, to)
    }

    /// RUNNING -> COMPLETED, recording the outputs.
    pub fn complete(&self, id: NodeId, result: JsonMap) -> ArborResult<Option<Transition>> {
        let mut state = self.state.write();
        let transition = state.transition(id, NodeStatus::Completed)?;
        if transition.is_some() {
            state.node_mut(id)?.result = Some(result);
        }
        Ok(transition)
    }

    /// Any live status -> FAILED, recording the error.
    pub fn fail(&self, id: NodeId, error: NodeError) -> ArborResult<Option<Transition>> {
        let mut state = self.state.write();
        let transition = state.transition(id, NodeStatus::Failed)?;
        if transition.is_some() {
            state.node_mut(id)?.error = Some(error);
        }
        Ok(transition)
    }

    /// NOT_READY -> READY if every dependency is completed; otherwise `None`.
    ///
    /// Check and change happen under one write lock, so concurrent callers
    /// promote a node at most once.
    pub fn promote_if_ready(&self, id: NodeId) -> ArborResult<Option<Transition>> {
        let mut state = self.state.write();
        if state.node(id)?.status != NodeStatus::NotReady || !state.deps_satisfied(id) {
            return Ok(None);
        }
        state.transition(id, NodeStatus::Ready)
    }

    /// Dependents of `id` that are NOT_READY with all dependencies completed.
    pub fn ready_dependents(&self, id: NodeId) -> Vec<NodeId> {
        let state = self.state.read();
        state
            .dependents
            .get(&id)
            .map(|deps| {
                deps.iter()
                    .copied()
                    .filter(|d| {
                        state
                            .nodes
                            .get(d)
                            .is_some_and(|n| n.status == NodeStatus::NotReady)
                            && state.deps_satisfied(*d)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // --- Queries ---

    /// A copy of the node.
    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.state.read().nodes.get(&id).cloned()
    }

    /// Whether the node exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.state.read().nodes.contains_key(&id)
    }

    /// Current status of the node.
    pub fn status(&self, id: NodeId) -> ArborResult<NodeStatus> {
        Ok(self.state.read().node(id)?.status)
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes `id` depends on.
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.state
            .read()
            .dependencies
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Nodes that depend on `id`.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.state
            .read()
            .dependents
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Members of the inner graph of `owner`, in creation order.
    pub fn inner_nodes(&self, owner: NodeId) -> Vec<NodeId> {
        self.state.read().inner(owner).to_vec()
    }

    /// Node and edge counts of the inner graph of `owner`.
    pub fn inner_counts(&self, owner: NodeId) -> (usize, usize) {
        let state = self.state.read();
        let nodes = state.inner(owner).len();
        let edges = state
            .edges
            .iter()
            .filter(|e| e.graph_owner_node_id == Some(owner))
            .count();
        (nodes, edges)
    }

    /// Whether `owner` has an inner graph whose members all completed.
    pub fn inner_complete(&self, owner: NodeId) -> bool {
        let state = self.state.read();
        let inner = state.inner(owner);
        !inner.is_empty()
            && inner.iter().all(|id| {
                state
                    .nodes
                    .get(id)
                    .is_some_and(|n| n.status == NodeStatus::Completed)
            })
    }

    /// Owning nodes of `id`, nearest first, ending at the run root.
    pub fn ancestors(&self, id: NodeId) -> ArborResult<Vec<NodeId>> {
        let state = self.state.read();
        let mut chain = Vec::new();
        let mut current = state.node(id)?.outer_node_id;
        while let Some(owner) = current {
            chain.push(owner);
            current = state.node(owner)?.outer_node_id;
        }
        Ok(chain)
    }

    /// Every node nested anywhere below `id`, breadth first.
    pub fn descendants(&self, id: NodeId) -> ArborResult<Vec<NodeId>> {
        let state = self.state.read();
        state.node(id)?;
        let mut out = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(owner) = queue.pop_front() {
            for child in state.inner(owner) {
                out.push(*child);
                queue.push_back(*child);
            }
        }
        Ok(out)
    }

    /// All nodes of the run rooted at `root`, in creation order.
    pub fn run_nodes(&self, root: NodeId) -> Vec<Node> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.root_node_id == root)
            .cloned()
            .collect()
    }

    /// Node count per status for the run rooted at `root`.
    pub fn statistics(&self, root: NodeId) -> BTreeMap<NodeStatus, usize> {
        let state = self.state.read();
        let mut stats = BTreeMap::new();
        for node in state.nodes.values().filter(|n| n.root_node_id == root) {
            *stats.entry(node.status).or_insert(0) += 1;
        }
        stats
    }

    /// Whether the run rooted at `root` can no longer make progress.
    ///
    /// A run is stalled when its root is not terminal and no node is READY,
    /// ASSIGNED, executing, promotable (NOT_READY with completed
    /// dependencies) or completable (RUNNING with a fully completed inner
    /// graph).
    pub fn is_stalled(&self, root: NodeId) -> bool {
        let state = self.state.read();
        match state.nodes.get(&root) {
            Some(r) if !r.status.is_terminal() => {}
            _ => return false,
        }
        let active = state
            .nodes
            .values()
            .filter(|n| n.root_node_id == root)
            .any(|n| match n.status {
                NodeStatus::Ready | NodeStatus::Assigned => true,
                NodeStatus::NotReady => state.deps_satisfied(n.node_id),
                NodeStatus::Running => {
                    let inner = state.inner(n.node_id);
                    inner.is_empty()
                        || inner.iter().all(|id| {
                            state
                                .nodes
                                .get(id)
                                .is_some_and(|c| c.status == NodeStatus::Completed)
                        })
                }
                NodeStatus::Completed | NodeStatus::Failed => false,
            });
        !active
    }

    // --- Snapshots ---

    /// Point-in-time copy of the whole graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        let state = self.state.read();
        GraphSnapshot {
            nodes: state
                .order
                .iter()
                .filter_map(|id| state.nodes.get(id).cloned())
                .collect(),
            edges: state.edges.clone(),
        }
    }

    /// Point-in-time copy of one run.
    pub fn snapshot_run(&self, root: NodeId) -> GraphSnapshot {
        let state = self.state.read();
        let nodes: Vec<Node> = state
            .order
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.root_node_id == root)
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

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use arbor_core::NodeType;
    use uuid::Uuid;

    fn root(graph: &TaskGraph) -> Node {
        graph
            .add_root(NewNode::new("G", "GENERAL", NodeType::Plan))
            .unwrap()
    }

    fn child(goal: &str, deps: Vec<NodeId>) -> ChildPlan {
        ChildPlan {
            node: NewNode::new(goal, "EXECUTION", NodeType::Execute),
            dependencies: deps,
        }
    }

    /// Drive a node through READY -> ASSIGNED -> RUNNING -> COMPLETED.
    fn finish(graph: &TaskGraph, id: NodeId) {
        graph.promote_if_ready(id).unwrap();
        graph.transition(id, NodeStatus::Assigned).unwrap();
        graph.transition(id, NodeStatus::Running).unwrap();
        graph.complete(id, JsonMap::new()).unwrap();
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::new();
        assert!(graph.is_empty());
        assert!(graph.snapshot().nodes.is_empty());
        assert!(graph.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_root_placement() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        assert_eq!(r.node_nid, "0");
        assert_eq!(r.layer, 0);
        assert_eq!(r.root_node_id, r.node_id);
        assert!(r.is_root());
        assert_eq!(r.status, NodeStatus::NotReady);
    }

    #[test]
    fn test_duplicate_root_rejected() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        let again = graph.add_root(NewNode::new("G", "GENERAL", NodeType::Plan).with_id(r.node_id));
        assert!(matches!(again, Err(ArborError::Graph(_))));
    }

    #[test]
    fn test_child_placement_and_nids() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        let a = graph
            .add_child(r.node_id, NewNode::new("A", "EXECUTION", NodeType::Plan))
            .unwrap();
        let b = graph
            .add_child(r.node_id, NewNode::new("B", "EXECUTION", NodeType::Execute))
            .unwrap();
        let a1 = graph
            .add_child(a.node_id, NewNode::new("A1", "EXECUTION", NodeType::Execute))
            .unwrap();
        assert_eq!(a.node_nid, "0.1");
        assert_eq!(b.node_nid, "0.2");
        assert_eq!(a1.node_nid, "0.1.1");
        assert_eq!(a1.layer, 2);
        assert_eq!(a1.root_node_id, r.node_id);
        assert_eq!(a1.outer_node_id, Some(a.node_id));
    }

    #[test]
    fn test_edge_dedup_and_scope_checks() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        let a = graph
            .add_child(r.node_id, NewNode::new("A", "X", NodeType::Plan))
            .unwrap();
        let b = graph
            .add_child(r.node_id, NewNode::new("B", "X", NodeType::Execute))
            .unwrap();
        let a1 = graph
            .add_child(a.node_id, NewNode::new("A1", "X", NodeType::Execute))
            .unwrap();

        let edge = graph.add_edge(a.node_id, b.node_id).unwrap().unwrap();
        assert_eq!(edge.graph_owner_node_id, Some(r.node_id));
        assert_eq!(edge.edge_id(), format!("{}->{}", a.node_id, b.node_id));
        assert!(graph.add_edge(a.node_id, b.node_id).unwrap().is_none());
        assert_eq!(graph.snapshot().edges.len(), 1);

        assert!(graph.add_edge(a1.node_id, b.node_id).is_err());
        assert!(graph.add_edge(b.node_id, b.node_id).is_err());
        assert!(graph.add_edge(b.node_id, a.node_id).is_err());
        assert!(graph.add_edge(Uuid::new_v4(), b.node_id).is_err());
    }

    #[test]
    fn test_state_machine_enforced() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        let id = r.node_id;
        assert!(matches!(
            graph.transition(id, NodeStatus::Running),
            Err(ArborError::IllegalTransition { .. })
        ));
        let t = graph.promote_if_ready(id).unwrap().unwrap();
        assert_eq!((t.from, t.to), (NodeStatus::NotReady, NodeStatus::Ready));
        assert!(graph.promote_if_ready(id).unwrap().is_none());
        assert!(graph.transition(id, NodeStatus::Running).is_err());
        graph.transition(id, NodeStatus::Assigned).unwrap();
        assert!(graph.transition(id, NodeStatus::Assigned).unwrap().is_none());
        graph.transition(id, NodeStatus::Running).unwrap();
        graph.complete(id, JsonMap::new()).unwrap();
        assert!(graph.transition(id, NodeStatus::Failed).is_err());
        assert!(graph.transition(id, NodeStatus::Ready).is_err());
    }

    #[test]
    fn test_ready_requires_completed_dependencies() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        let exp = graph
            .expand(r.node_id, vec![child("A", vec![])])
            .unwrap();
        let a = exp.nodes[0].node_id;
        let b = graph
            .add_child(r.node_id, NewNode::new("B", "X", NodeType::Execute))
            .unwrap()
            .node_id;
        graph.add_edge(a, b).unwrap();
        assert!(matches!(
            graph.transition(b, NodeStatus::Ready),
            Err(ArborError::Graph(_))
        ));
        assert!(graph.promote_if_ready(b).unwrap().is_none());
    }

    #[test]
    fn test_fail_records_error_once() {
        let graph = TaskGraph::new();
        let id = root(&graph).node_id;
        let first = NodeError {
            error_type: "action_failed".into(),
            message: "first".into(),
        };
        let second = NodeError {
            error_type: "cascade".into(),
            message: "second".into(),
        };
        assert!(graph.fail(id, first.clone()).unwrap().is_some());
        assert!(graph.fail(id, second).unwrap().is_none());
        assert_eq!(graph.get(id).unwrap().error, Some(first));
    }

    #[test]
    fn test_expand_builds_scope() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        let a = child("A", vec![]);
        let a_id = a.node.node_id;
        let b = child("B", vec![a_id]);
        let exp = graph.expand(r.node_id, vec![a, b]).unwrap();
        assert_eq!(exp.nodes.len(), 2);
        assert_eq!(exp.edges.len(), 1);
        assert_eq!(exp.nodes[1].node_nid, "0.2");
        assert_eq!(graph.inner_counts(r.node_id), (2, 1));
        assert_eq!(graph.inner_nodes(r.node_id), vec![a_id, exp.nodes[1].node_id]);
        assert_eq!(graph.dependencies(exp.nodes[1].node_id), vec![a_id]);
    }

    #[test]
    fn test_expand_rejects_bad_plans_atomically() {
        let graph = TaskGraph::new();
        let r = root(&graph);

        let stranger = child("S", vec![Uuid::new_v4()]);
        assert!(graph.expand(r.node_id, vec![stranger]).is_err());

        let a = child("A", vec![]);
        let b = child("B", vec![]);
        let (a_id, b_id) = (a.node.node_id, b.node.node_id);
        let cyclic = vec![
            ChildPlan {
                dependencies: vec![b_id],
                ..a.clone()
            },
            ChildPlan {
                dependencies: vec![a_id],
                ..b
            },
        ];
        assert!(graph.expand(r.node_id, cyclic).is_err());

        let dup = vec![a.clone(), a];
        assert!(graph.expand(r.node_id, dup).is_err());

        assert_eq!(graph.len(), 1);
        assert!(graph.snapshot().edges.is_empty());
    }

    #[test]
    fn test_expand_twice_rejected() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        graph.expand(r.node_id, vec![child("A", vec![])]).unwrap();
        assert!(graph.expand(r.node_id, vec![child("B", vec![])]).is_err());
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        let exp = graph.expand(r.node_id, vec![child("A", vec![])]).unwrap();
        let a = exp.nodes[0].node_id;
        let inner = graph
            .expand(a, vec![child("A1", vec![]), child("A2", vec![])])
            .unwrap();
        let a2 = inner.nodes[1].node_id;

        assert_eq!(graph.ancestors(a2).unwrap(), vec![a, r.node_id]);
        assert!(graph.ancestors(r.node_id).unwrap().is_empty());
        let desc = graph.descendants(r.node_id).unwrap();
        assert_eq!(desc.len(), 3);
        assert_eq!(desc[0], a);
        assert!(graph.descendants(a2).unwrap().is_empty());
        assert!(graph.ancestors(Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_ready_dependents_and_inner_complete() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        finish_up_to_running(&graph, r.node_id);
        let a = child("A", vec![]);
        let a_id = a.node.node_id;
        let b = child("B", vec![a_id]);
        let b_id = b.node.node_id;
        graph.expand(r.node_id, vec![a, b]).unwrap();

        assert!(graph.ready_dependents(a_id).is_empty());
        finish(&graph, a_id);
        assert_eq!(graph.ready_dependents(a_id), vec![b_id]);
        assert!(!graph.inner_complete(r.node_id));
        finish(&graph, b_id);
        assert!(graph.inner_complete(r.node_id));
    }

    fn finish_up_to_running(graph: &TaskGraph, id: NodeId) {
        graph.promote_if_ready(id).unwrap();
        graph.transition(id, NodeStatus::Assigned).unwrap();
        graph.transition(id, NodeStatus::Running).unwrap();
    }

    #[test]
    fn test_stall_detection() {
        let graph = TaskGraph::new();
        let r = root(&graph);
        finish_up_to_running(&graph, r.node_id);
        // Executing root: progress possible.
        assert!(!graph.is_stalled(r.node_id));

        let a = child("A", vec![]);
        let a_id = a.node.node_id;
        let b = child("B", vec![a_id]);
        graph.expand(r.node_id, vec![a, b]).unwrap();
        // A is promotable.
        assert!(!graph.is_stalled(r.node_id));

        graph.promote_if_ready(a_id).unwrap();
        graph
            .fail(
                a_id,
                NodeError {
                    error_type: "x".into(),
                    message: "y".into(),
                },
            )
            .unwrap();
        // B waits on a failed dependency, root waits on B.
        assert!(graph.is_stalled(r.node_id));
    }

    #[test]
    fn test_statistics_and_run_filtering() {
        let graph = TaskGraph::new();
        let r1 = root(&graph);
        let r2 = root(&graph);
        graph.expand(r1.node_id, vec![child("A", vec![])]).unwrap();
        let stats = graph.statistics(r1.node_id);
        assert_eq!(stats.get(&NodeStatus::NotReady), Some(&2));
        assert_eq!(graph.run_nodes(r2.node_id).len(), 1);
        assert_eq!(graph.snapshot_run(r1.node_id).nodes.len(), 2);
        assert_eq!(graph.snapshot().nodes.len(), 3);
    }
}
