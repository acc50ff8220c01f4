//! WebSocket endpoint streaming node state changes.
//!
//! Each connection gets its own bounded outbound queue registered with the
//! hub. One spawned task drains that queue onto the socket while this task
//! reads client frames; whichever side ends first tears the session down.

use std::time::Duration;

use api_types::ClientMessage;
use api_types::ClientMessageKind;
use futures::SinkExt;
use futures::StreamExt;
use poem::handler;
use poem::web::websocket::Message;
use poem::web::websocket::WebSocket;
use poem::web::websocket::WebSocketStream;
use poem::web::Data;
use poem::web::Query;
use poem::IntoResponse;
use serde::Deserialize;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use crate::hub::HubHandle;

const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters accepted by the stream endpoint.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Pre-subscribe to one cluster on connect.
    pub cluster: Option<String>,
}

#[handler]
pub async fn node_stream(
    ws: WebSocket,
    Query(query): Query<StreamQuery>,
    hub: Data<&HubHandle>,
) -> impl IntoResponse {
    let hub = hub.0.clone();
    ws.on_upgrade(move |socket| run_stream_session(socket, hub, query.cluster))
}

async fn run_stream_session(
    socket: WebSocketStream,
    hub: HubHandle,
    initial_cluster: Option<String>,
) {
    let client_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = hub.client_queue();
    hub.register(&client_id, outbound_tx, initial_cluster.into_iter().collect())
        .await;
    info!(client = %client_id, "Stream session established");

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    debug!("Failed to serialize stream message: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        // queue closed, the hub no longer knows this client
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => handle_client_message(&hub, &client_id, message).await,
                Err(e) => {
                    debug!(client = %client_id, "Ignoring malformed client message: {e}");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client = %client_id, "Stream read failed: {e}");
                break;
            }
        }
    }

    // unregistration drops the outbound sender, which ends the writer
    hub.unregister(&client_id).await;
    if tokio::time::timeout(WRITER_STOP_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(client = %client_id, "Stream session closed");
}

async fn handle_client_message(hub: &HubHandle, client_id: &str, message: ClientMessage) {
    match message.kind {
        ClientMessageKind::Subscribe => match message.data {
            Some(cluster) => hub.subscribe(client_id, &cluster).await,
            None => debug!(client = %client_id, "Subscribe without a cluster name"),
        },
        ClientMessageKind::Unsubscribe => match message.data {
            Some(cluster) => hub.unsubscribe(client_id, &cluster).await,
            None => debug!(client = %client_id, "Unsubscribe without a cluster name"),
        },
        ClientMessageKind::Pong => hub.pong(client_id).await,
    }
}
