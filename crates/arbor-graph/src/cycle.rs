use arbor_core::NodeId;
use std::collections::HashMap;

/// Whether the dependency map (node -> nodes it depends on) contains a cycle.
///
/// Dependencies on ids missing from the map are treated as leaves.
pub fn has_cycle(dependencies: &HashMap<NodeId, Vec<NodeId>>) -> bool {
    let mut visited = HashMap::new();
    dependencies
        .keys()
        .any(|&id| dfs_cycle(dependencies, id, &mut visited))
}

fn dfs_cycle(
    dependencies: &HashMap<NodeId, Vec<NodeId>>,
    id: NodeId,
    visited: &mut HashMap<NodeId, u8>,
) -> bool {
    match visited.get(&id) {
        Some(1) => return true,  // back edge
        Some(2) => return false, // finished
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(deps) = dependencies.get(&id) {
        for dep in deps {
            if dfs_cycle(dependencies, *dep, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}
