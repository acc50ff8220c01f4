//! Pods-per-node counters maintained from pod events.
//!
//! Stores no pod bodies. A reverse index from pod UID to its counted node
//! makes adds idempotent, turns node moves into a decrement plus increment,
//! and guarantees each pod is decremented at most once.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use api_types::PlacementStats;
use dashmap::DashMap;
use dashmap::DashSet;
use tracing::debug;

use crate::k8s::EventKind;
use crate::k8s::PodEvent;
use crate::k8s::PodEventHandler;
use crate::k8s::PodRef;
use crate::state::NodeKey;

/// Phases after which a pod no longer occupies its node.
const TERMINAL_PHASES: [&str; 2] = ["Succeeded", "Failed"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PodKey {
    cluster: String,
    uid: String,
}

impl PodKey {
    fn new(cluster: &str, uid: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            uid: uid.to_string(),
        }
    }
}

pub struct PlacementIndex {
    counts: DashMap<NodeKey, AtomicI64>,
    pod_nodes: DashMap<PodKey, String>,
    synced: DashSet<String>,
}

impl PlacementIndex {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
            pod_nodes: DashMap::new(),
            synced: DashSet::new(),
        }
    }

    /// Pods counted on a node; absent counters read as zero.
    pub fn count(&self, cluster: &str, node: &str) -> i64 {
        self.counts
            .get(&NodeKey::new(cluster, node))
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn counts(&self, cluster: &str) -> HashMap<String, i64> {
        self.counts
            .iter()
            .filter(|entry| entry.key().cluster == cluster)
            .map(|entry| {
                (
                    entry.key().node.clone(),
                    entry.value().load(Ordering::SeqCst),
                )
            })
            .collect()
    }

    /// Sticky marker set once the cluster's initial pod list has completed.
    pub fn mark_synced(&self, cluster: &str) {
        self.synced.insert(cluster.to_string());
    }

    /// Whether counters for this cluster mean anything. Distinguishes "zero
    /// pods" from "never synchronized" so callers can fall back to a direct
    /// count instead of trusting a silent zero.
    pub fn is_ready(&self, cluster: &str) -> bool {
        self.synced.contains(cluster)
            || self.counts.iter().any(|entry| entry.key().cluster == cluster)
    }

    /// Drop a cluster's counters and reverse index. The synced marker stays:
    /// the cluster has completed a list once and its zeros remain meaningful.
    pub fn invalidate_cluster(&self, cluster: &str) {
        self.counts.retain(|key, _| key.cluster != cluster);
        self.pod_nodes.retain(|key, _| key.cluster != cluster);
    }

    pub fn stats(&self) -> PlacementStats {
        PlacementStats {
            tracked_pods: self.pod_nodes.len(),
            counted_nodes: self.counts.len(),
            synced_clusters: self.synced.len(),
        }
    }

    fn on_pod_added(&self, cluster: &str, record: &PodRef) {
        if is_terminal(&record.phase) {
            return;
        }
        let key = PodKey::new(cluster, &record.uid);
        match self.pod_nodes.insert(key, record.node_name.clone()) {
            // redelivered add for the same placement
            Some(previous) if previous == record.node_name => {}
            Some(previous) => {
                self.decrement(cluster, &previous);
                self.increment(cluster, &record.node_name);
            }
            None => self.increment(cluster, &record.node_name),
        }
    }

    fn on_pod_updated(&self, cluster: &str, record: &PodRef) {
        let key = PodKey::new(cluster, &record.uid);
        let recorded = self.pod_nodes.get(&key).map(|entry| entry.value().clone());

        match recorded {
            Some(old) => {
                if !record.node_name.is_empty() && old != record.node_name {
                    self.pod_nodes.insert(key.clone(), record.node_name.clone());
                    self.decrement(cluster, &old);
                    self.increment(cluster, &record.node_name);
                    debug!(
                        cluster = %cluster,
                        pod = %record.name,
                        from = %old,
                        to = %record.node_name,
                        "Pod moved between nodes"
                    );
                }
            }
            None => {
                if !record.node_name.is_empty() && !is_terminal(&record.phase) {
                    self.pod_nodes.insert(key.clone(), record.node_name.clone());
                    self.increment(cluster, &record.node_name);
                }
            }
        }

        if is_terminal(&record.phase) {
            self.forget(&key, cluster);
        }
    }

    fn on_pod_deleted(&self, cluster: &str, record: &PodRef) {
        self.forget(&PodKey::new(cluster, &record.uid), cluster);
    }

    /// Remove the reverse-index entry and decrement whichever node it was
    /// counted on. Whoever wins the removal does the decrement, so replayed
    /// terminal updates and deletes cannot drive a counter below zero.
    fn forget(&self, key: &PodKey, cluster: &str) {
        if let Some((_, node)) = self.pod_nodes.remove(key) {
            self.decrement(cluster, &node);
        }
    }

    fn increment(&self, cluster: &str, node: &str) {
        self.counts
            .entry(NodeKey::new(cluster, node))
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self, cluster: &str, node: &str) {
        let key = NodeKey::new(cluster, node);
        if let Some(counter) = self.counts.get(&key) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        self.counts
            .remove_if(&key, |_, counter| counter.load(Ordering::SeqCst) <= 0);
    }
}

impl Default for PlacementIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PodEventHandler for PlacementIndex {
    fn on_pod_event(&self, event: PodEvent) {
        let record = PodRef::from_pod(&event.pod);
        if record.uid.is_empty() {
            return;
        }
        // unplaced pods carry nothing to count; deletes still clean up
        if record.node_name.is_empty() && event.kind != EventKind::Deleted {
            return;
        }
        match event.kind {
            EventKind::Added => self.on_pod_added(&event.cluster, &record),
            EventKind::Updated => self.on_pod_updated(&event.cluster, &record),
            EventKind::Deleted => self.on_pod_deleted(&event.cluster, &record),
        }
    }
}

fn is_terminal(phase: &str) -> bool {
    TERMINAL_PHASES.contains(&phase)
}
