//! Authoritative cache of full node snapshots, keyed by cluster and node.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use api_types::CacheStats;
use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Node;
use tracing::info;

use crate::k8s::EventKind;
use crate::k8s::NodeEvent;
use crate::k8s::NodeEventHandler;
use crate::state::NodeKey;

const DEFAULT_STATIC_TTL: Duration = Duration::from_secs(60 * 60);

struct CachedNode {
    node: Arc<Node>,
    updated_at: DateTime<Utc>,
}

/// Node snapshot store fed by watch events.
///
/// Values are shared snapshots behind [`Arc`], so readers never observe a
/// partial write and never block the watch pipeline. The staleness horizon
/// is advisory only; watch resyncs rewrite entries long before it elapses
/// and nothing is ever evicted on a timer.
pub struct NodeStateCache {
    entries: DashMap<NodeKey, CachedNode>,
    cluster_nodes: DashMap<String, HashSet<String>>,
    static_ttl: Duration,
}

impl NodeStateCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_STATIC_TTL)
    }

    pub fn with_ttl(static_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            cluster_nodes: DashMap::new(),
            static_ttl,
        }
    }

    pub fn get(&self, cluster: &str, node: &str) -> Option<Arc<Node>> {
        self.entries
            .get(&NodeKey::new(cluster, node))
            .map(|entry| entry.node.clone())
    }

    /// When the entry was last written.
    pub fn touched_at(&self, cluster: &str, node: &str) -> Option<DateTime<Utc>> {
        self.entries
            .get(&NodeKey::new(cluster, node))
            .map(|entry| entry.updated_at)
    }

    pub fn list(&self, cluster: &str) -> Vec<Arc<Node>> {
        let names: Vec<String> = match self.cluster_nodes.get(cluster) {
            Some(names) => names.iter().cloned().collect(),
            None => return Vec::new(),
        };
        names.iter().filter_map(|name| self.get(cluster, name)).collect()
    }

    /// Bulk upsert of a freshly listed inventory. Used right after a watch
    /// start so the cache is populated before any caller can read it.
    pub fn seed(&self, cluster: &str, nodes: Vec<Arc<Node>>) {
        let count = nodes.len();
        for node in nodes {
            self.upsert(cluster, node);
        }
        info!(cluster = %cluster, nodes = count, "Cache seeded from initial inventory");
    }

    pub fn invalidate_cluster(&self, cluster: &str) {
        let Some((_, names)) = self.cluster_nodes.remove(cluster) else {
            return;
        };
        for name in &names {
            self.entries.remove(&NodeKey::new(cluster, name));
        }
        info!(cluster = %cluster, dropped = names.len(), "Cluster cache entries invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            node_count: self.entries.len(),
            cluster_count: self.cluster_nodes.len(),
            static_ttl_secs: self.static_ttl.as_secs(),
        }
    }

    fn upsert(&self, cluster: &str, node: Arc<Node>) {
        let Some(name) = node.metadata.name.clone() else {
            return;
        };
        self.cluster_nodes
            .entry(cluster.to_string())
            .or_default()
            .insert(name.clone());
        self.entries.insert(
            NodeKey::new(cluster, &name),
            CachedNode {
                node,
                updated_at: Utc::now(),
            },
        );
    }

    fn remove(&self, cluster: &str, name: &str) {
        self.entries.remove(&NodeKey::new(cluster, name));
        if let Some(mut names) = self.cluster_nodes.get_mut(cluster) {
            names.remove(name);
        }
        self.cluster_nodes
            .remove_if(cluster, |_, names| names.is_empty());
    }
}

impl Default for NodeStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeEventHandler for NodeStateCache {
    fn on_node_event(&self, event: NodeEvent) {
        match event.kind {
            // an update for an unknown node degrades to an add
            EventKind::Added | EventKind::Updated => self.upsert(&event.cluster, event.node),
            EventKind::Deleted => self.remove(&event.cluster, event.node_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::k8s::ALL_FIELDS;

    fn test_node(name: &str) -> Arc<Node> {
        Arc::new(Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        })
    }

    fn event(kind: EventKind, cluster: &str, node: Arc<Node>) -> NodeEvent {
        NodeEvent {
            kind,
            cluster: cluster.to_string(),
            node,
            previous: None,
            changes: vec![ALL_FIELDS.to_string()],
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn add_then_get_and_list() {
        let cache = NodeStateCache::new();
        cache.on_node_event(event(EventKind::Added, "prod-eu", test_node("worker-1")));
        cache.on_node_event(event(EventKind::Added, "prod-eu", test_node("worker-2")));
        cache.on_node_event(event(EventKind::Added, "prod-us", test_node("worker-1")));

        assert!(cache.get("prod-eu", "worker-1").is_some());
        assert!(cache.get("prod-eu", "worker-3").is_none());
        assert_eq!(cache.list("prod-eu").len(), 2);
        assert_eq!(cache.list("prod-us").len(), 1);
        assert!(cache.list("staging").is_empty());
        assert!(cache.touched_at("prod-eu", "worker-1").is_some());
    }

    #[test]
    fn update_for_unknown_node_degrades_to_add() {
        let cache = NodeStateCache::new();
        cache.on_node_event(event(EventKind::Updated, "prod-eu", test_node("worker-1")));
        assert!(cache.get("prod-eu", "worker-1").is_some());
    }

    #[test]
    fn delete_removes_entry_and_membership() {
        let cache = NodeStateCache::new();
        cache.on_node_event(event(EventKind::Added, "prod-eu", test_node("worker-1")));
        cache.on_node_event(event(EventKind::Deleted, "prod-eu", test_node("worker-1")));

        assert!(cache.get("prod-eu", "worker-1").is_none());
        assert!(cache.list("prod-eu").is_empty());
        assert_eq!(cache.stats().cluster_count, 0, "empty name set must be dropped");
    }

    #[test]
    fn seed_populates_whole_inventory() {
        let cache = NodeStateCache::new();
        cache.seed("prod-eu", vec![test_node("worker-1"), test_node("worker-2")]);

        assert_eq!(cache.list("prod-eu").len(), 2);
        assert_eq!(cache.stats().node_count, 2);
    }

    #[test]
    fn invalidate_cluster_leaves_other_clusters_alone() {
        let cache = NodeStateCache::new();
        cache.seed("prod-eu", vec![test_node("worker-1")]);
        cache.seed("prod-us", vec![test_node("worker-1")]);

        cache.invalidate_cluster("prod-eu");

        assert!(cache.get("prod-eu", "worker-1").is_none());
        assert!(cache.get("prod-us", "worker-1").is_some());
        let stats = cache.stats();
        assert_eq!(stats.node_count, 1);
        assert_eq!(stats.cluster_count, 1);
    }
}
