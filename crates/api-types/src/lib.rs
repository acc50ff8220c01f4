//! Shared API type definitions
//!
//! This crate contains the wire contract shared between the fleetd daemon and
//! its clients: WebSocket stream messages, REST response envelopes and the
//! statistics views exposed by the status endpoints.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Kind discriminator for server-to-client stream messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMessageKind {
    /// A node appeared on a watched cluster
    NodeAdd,
    /// A watched node changed in a way consumers care about
    NodeUpdate,
    /// A node left a watched cluster
    NodeDelete,
    /// Server heartbeat, answer with a `pong` client message
    Ping,
    /// Greeting sent right after registration
    Connected,
    /// Server-side problem description
    Error,
}

/// Message pushed to WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: StreamMessageKind,
    /// Cluster the message concerns; absent on broadcasts to every client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// Node the message concerns (node events only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Full node object for node events, free-form payload otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Changed field names on `node_update`, `["*"]` on add and delete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<String>>,
    /// When the underlying event was observed
    pub timestamp: DateTime<Utc>,
}

impl StreamMessage {
    /// Heartbeat message.
    pub fn ping() -> Self {
        Self::control(StreamMessageKind::Ping, None)
    }

    /// Greeting confirming a successful registration.
    pub fn connected() -> Self {
        Self::control(
            StreamMessageKind::Connected,
            Some("connected to node state stream".to_string()),
        )
    }

    /// Server-side error description.
    pub fn error(message: impl Into<String>) -> Self {
        Self::control(StreamMessageKind::Error, Some(message.into()))
    }

    fn control(kind: StreamMessageKind, text: Option<String>) -> Self {
        Self {
            kind,
            cluster_name: None,
            node_name: None,
            data: text.map(serde_json::Value::String),
            changes: None,
            timestamp: Utc::now(),
        }
    }
}

/// Kind discriminator for client-to-server messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessageKind {
    /// Start receiving events for the cluster named in `data`
    Subscribe,
    /// Stop receiving events for the cluster named in `data`
    Unsubscribe,
    /// Heartbeat answer
    Pong,
}

/// Message received from a WebSocket client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: ClientMessageKind,
    /// Cluster name for subscribe and unsubscribe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Response envelope used by every REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response payload (present when successful)
    pub data: Option<T>,
    /// Response message
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}

/// Point-in-time view of the node snapshot cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Cached node snapshots across all clusters
    pub node_count: usize,
    /// Clusters with at least one cached node
    pub cluster_count: usize,
    /// Advisory staleness horizon in seconds; entries are never evicted by age
    pub static_ttl_secs: u64,
}

/// Point-in-time view of the pod placement index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementStats {
    /// Pods currently tracked in the reverse index
    pub tracked_pods: usize,
    /// Nodes with a non-zero pod counter
    pub counted_nodes: usize,
    /// Clusters whose initial pod list has completed
    pub synced_clusters: usize,
}

/// Point-in-time view of the notification hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    /// Connected WebSocket clients
    pub client_count: usize,
    /// Cluster subscriptions across all clients
    pub subscription_count: usize,
}

/// Circuit breaker state for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// Cluster name
    pub cluster_name: String,
    /// Whether the last outbound call succeeded
    pub healthy: bool,
    /// Consecutive failures since the last success
    pub consecutive_failures: u32,
    /// Whether the failure threshold has been crossed
    pub circuit_open: bool,
    /// When the cluster was last probed
    pub last_checked_at: DateTime<Utc>,
    /// Description of the most recent failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One row of the per-cluster node listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    /// Node name
    pub name: String,
    /// Derived readiness: `Ready`, `NotReady` or `Unknown`
    pub status: String,
    /// Whether the node accepts new pods
    pub schedulable: bool,
    /// Pods placed on the node; `null` until the cluster's pod index is ready
    pub pod_count: Option<i64>,
    /// Node labels
    pub labels: BTreeMap<String, String>,
}

/// Aggregated daemon status for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Cluster name to watch-session-active
    pub watchers: HashMap<String, bool>,
    /// Node cache statistics
    pub cache: CacheStats,
    /// Placement index statistics
    pub placement: PlacementStats,
    /// Notification hub statistics
    pub hub: HubStats,
    /// Registered clusters
    pub cluster_count: usize,
}

/// Request body for registering a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterClusterRequest {
    /// Cluster name, unique within the daemon
    pub name: String,
    /// Path to a kubeconfig readable by the daemon; in-cluster or default
    /// credentials apply when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}
