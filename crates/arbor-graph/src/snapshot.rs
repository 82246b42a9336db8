use crate::node::{Edge, Node};
use arbor_core::{NodeId, NodeStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time copy of a graph: nodes in creation order, edges in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// All nodes.
    pub nodes: Vec<Node>,
    /// All edges.
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    /// Look up a node by id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    /// Look up a node by path id, e.g. "0.2.1".
    pub fn node_by_nid(&self, nid: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_nid == nid)
    }

    /// Node count per status.
    pub fn status_counts(&self) -> BTreeMap<NodeStatus, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }

    /// Structural view used to compare two snapshots: ids, placement,
    /// status and edges, ignoring timestamps.
    pub fn shape(&self) -> (Vec<(NodeId, String, Option<NodeId>, NodeStatus)>, Vec<Edge>) {
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .map(|n| (n.node_id, n.node_nid.clone(), n.outer_node_id, n.status))
            .collect();
        nodes.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        let mut edges = self.edges.clone();
        edges.sort_by_key(|e| (e.parent_node_id, e.child_node_id));
        (nodes, edges)
    }
}
