use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use vigil_core::normalize_path;
use vigil_store::{GraphStore, NeighborRecord, StoreError};

/// Changed files sit at hop 0; nothing past this hop is ever loaded.
pub const MAX_CONTEXT_HOPS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextNode {
    pub path: String,
    pub hop: u32,
    pub relation: String,
}

/// Visited nodes with their hop tag plus the frontier still to expand. Growth
/// is one breadth-first layer per call, never recursive.
#[derive(Debug, Clone, Default)]
pub struct ContextArena {
    nodes: Vec<ContextNode>,
    index: HashMap<String, usize>,
    frontier: VecDeque<usize>,
    loaded_hops: u32,
}

impl ContextArena {
    pub fn new(seeds: &[String]) -> Self {
        let mut arena = Self::default();
        for seed in seeds {
            let path = normalize_path(seed);
            if path.is_empty() || arena.index.contains_key(&path) {
                continue;
            }
            let slot = arena.push(ContextNode {
                path,
                hop: 0,
                relation: "CHANGED".to_owned(),
            });
            arena.frontier.push_back(slot);
        }
        arena
    }

    /// Loads the next layer of neighbors. Returns the number of new nodes, or
    /// zero once the hop cap is reached.
    pub fn expand(&mut self, graph: &dyn GraphStore) -> Result<usize, StoreError> {
        if self.loaded_hops >= MAX_CONTEXT_HOPS {
            return Ok(0);
        }
        let next_hop = self.loaded_hops + 1;

        let mut discovered = Vec::new();
        for &slot in &self.frontier {
            let origin = &self.nodes[slot].path;
            for neighbor in neighbors_with_retry(graph, origin)? {
                discovered.push((neighbor.path, neighbor.relation));
            }
        }

        self.frontier.clear();
        let mut added = 0;
        for (path, relation) in discovered {
            let path = normalize_path(&path);
            if self.index.contains_key(&path) {
                continue;
            }
            let slot = self.push(ContextNode {
                path,
                hop: next_hop,
                relation,
            });
            self.frontier.push_back(slot);
            added += 1;
        }

        self.loaded_hops = next_hop;
        Ok(added)
    }

    pub fn loaded_hops(&self) -> u32 {
        self.loaded_hops
    }

    pub fn can_expand(&self) -> bool {
        self.loaded_hops < MAX_CONTEXT_HOPS
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ContextNode] {
        &self.nodes
    }

    pub fn paths_at(&self, hop: u32) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|node| node.hop == hop)
            .map(|node| node.path.as_str())
            .collect()
    }

    fn push(&mut self, node: ContextNode) -> usize {
        let slot = self.nodes.len();
        self.index.insert(node.path.clone(), slot);
        self.nodes.push(node);
        slot
    }
}

/// One retry on a transient store failure, matching the signal path.
fn neighbors_with_retry(
    graph: &dyn GraphStore,
    file_path: &str,
) -> Result<Vec<NeighborRecord>, StoreError> {
    match graph.neighbors(file_path, 1) {
        Err(err) if err.is_transient() => {
            tracing::debug!(file = %file_path, error = %err, "retrying transient neighbor lookup");
            graph.neighbors(file_path, 1)
        }
        other => other,
    }
}
