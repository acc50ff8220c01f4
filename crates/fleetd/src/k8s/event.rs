//! Typed change events produced by the cluster watch sessions.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;

/// Wildcard used in place of a field list on add and delete events.
pub const ALL_FIELDS: &str = "*";

/// What happened to a watched object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

/// A node state transition observed on one cluster.
///
/// Snapshots are shared behind [`Arc`]: every handler sees the same immutable
/// body without copying it.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: EventKind,
    pub cluster: String,
    pub node: Arc<Node>,
    /// Prior snapshot, populated for updates.
    pub previous: Option<Arc<Node>>,
    /// Names of the fields that differ, `["*"]` for add and delete.
    pub changes: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

impl NodeEvent {
    pub fn node_name(&self) -> &str {
        self.node.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Slim per-pod record retained between events. Only identity, placement and
/// lifecycle phase are kept; full previous bodies are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub uid: String,
    pub name: String,
    pub node_name: String,
    pub phase: String,
}

impl PodRef {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.clone())
                .unwrap_or_default(),
            phase: pod
                .status
                .as_ref()
                .and_then(|status| status.phase.clone())
                .unwrap_or_default(),
        }
    }
}

/// A pod placement or lifecycle transition observed on one cluster.
#[derive(Debug, Clone)]
pub struct PodEvent {
    pub kind: EventKind,
    pub cluster: String,
    pub pod: Arc<Pod>,
    /// Prior placement record, populated for updates.
    pub previous: Option<PodRef>,
    pub occurred_at: DateTime<Utc>,
}

impl PodEvent {
    pub fn pod_name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Receives node change events. Implementations must not block: each call
/// runs on its own task but shares the tokio runtime with the watch loops.
pub trait NodeEventHandler: Send + Sync {
    fn on_node_event(&self, event: NodeEvent);
}

/// Receives pod change events under the same contract as [`NodeEventHandler`].
pub trait PodEventHandler: Send + Sync {
    fn on_pod_event(&self, event: PodEvent);
}
