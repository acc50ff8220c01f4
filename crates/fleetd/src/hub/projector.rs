//! Bridges node events onto the WebSocket stream.

use api_types::StreamMessage;
use api_types::StreamMessageKind;
use tracing::warn;

use crate::hub::HubHandle;
use crate::k8s::EventKind;
use crate::k8s::NodeEvent;
use crate::k8s::NodeEventHandler;

/// Turns node events into `node_add` / `node_update` / `node_delete` stream
/// messages carrying the full node body, then enqueues them on the hub.
pub struct NodeEventProjector {
    hub: HubHandle,
}

impl NodeEventProjector {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }
}

impl NodeEventHandler for NodeEventProjector {
    fn on_node_event(&self, event: NodeEvent) {
        let kind = match event.kind {
            EventKind::Added => StreamMessageKind::NodeAdd,
            EventKind::Updated => StreamMessageKind::NodeUpdate,
            EventKind::Deleted => StreamMessageKind::NodeDelete,
        };
        let node_name = event.node_name().to_string();
        let data = match serde_json::to_value(event.node.as_ref()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(node = %node_name, "Failed to serialize node body: {e}");
                None
            }
        };
        self.hub.broadcast(StreamMessage {
            kind,
            cluster_name: Some(event.cluster),
            node_name: Some(node_name),
            data,
            changes: Some(event.changes),
            timestamp: event.occurred_at,
        });
    }
}
