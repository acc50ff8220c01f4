//! In-memory state derived from watch events: full node snapshots and the
//! pods-per-node placement counters.

pub mod node_cache;
pub mod placement;

/// Key for anything stored per cluster and node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    cluster: String,
    node: String,
}

impl NodeKey {
    fn new(cluster: &str, node: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            node: node.to_string(),
        }
    }
}
