use std::sync::Arc;

use error_stack::Report;
use poem::delete;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::handlers::get_cluster_health;
use super::handlers::get_node;
use super::handlers::get_status;
use super::handlers::list_nodes;
use super::handlers::ping;
use super::handlers::register_cluster;
use super::handlers::reset_cluster_health;
use super::handlers::unregister_cluster;
use super::stream::node_stream;
use super::ApiError;
use crate::coordinator::FleetCoordinator;
use crate::hub::HubHandle;

/// HTTP server exposing node state, cluster lifecycle and the event stream.
pub struct ApiServer {
    coordinator: Arc<FleetCoordinator>,
    hub: HubHandle,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(coordinator: Arc<FleetCoordinator>, hub: HubHandle, listen_addr: String) -> Self {
        Self {
            coordinator,
            hub,
            listen_addr,
        }
    }

    /// Start the API server
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = build_routes(self.coordinator, self.hub);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}

fn build_routes(coordinator: Arc<FleetCoordinator>, hub: HubHandle) -> impl poem::Endpoint {
    Route::new()
        .at("/healthz", get(ping))
        .at("/api/v1/status", get(get_status))
        .at("/api/v1/clusters", post(register_cluster))
        .at("/api/v1/clusters/health", get(get_cluster_health))
        .at("/api/v1/clusters/:cluster", delete(unregister_cluster))
        .at(
            "/api/v1/clusters/:cluster/health/reset",
            post(reset_cluster_health),
        )
        .at("/api/v1/clusters/:cluster/nodes", get(list_nodes))
        .at("/api/v1/clusters/:cluster/nodes/:node", get(get_node))
        .at("/api/v1/stream", get(node_stream))
        .data(coordinator)
        .data(hub)
        .with(Tracing)
}

#[cfg(test)]
mod tests {
    use api_types::RegisterClusterRequest;
    use poem::test::TestClient;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::health::HealthConfig;
    use crate::hub::HubConfig;
    use crate::hub::NotificationHub;
    use crate::k8s::WatchConfig;

    fn test_server() -> (TestClient<impl poem::Endpoint>, Arc<FleetCoordinator>) {
        let (hub, handle) = NotificationHub::new(HubConfig::default());
        tokio::spawn(hub.run(CancellationToken::new()));
        let coordinator = Arc::new(FleetCoordinator::new(
            WatchConfig::default(),
            HealthConfig::default(),
            handle.clone(),
            None,
        ));
        let app = build_routes(coordinator.clone(), handle);
        (TestClient::new(app), coordinator)
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let (client, _coordinator) = test_server();
        let resp = client.get("/healthz").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("ok").await;
    }

    #[tokio::test]
    async fn status_returns_an_empty_snapshot() {
        let (client, _coordinator) = test_server();
        let resp = client.get("/api/v1/status").send().await;
        resp.assert_status_is_ok();

        let json = resp.json().await;
        let envelope = json.value().object();
        assert!(envelope.get("success").bool());
        let data = envelope.get("data").object();
        assert_eq!(data.get("cluster_count").i64(), 0);
    }

    #[tokio::test]
    async fn missing_node_yields_a_failure_envelope() {
        let (client, _coordinator) = test_server();
        let resp = client
            .get("/api/v1/clusters/prod-eu/nodes/worker-1")
            .send()
            .await;
        resp.assert_status_is_ok();

        let json = resp.json().await;
        let envelope = json.value().object();
        assert!(!envelope.get("success").bool());
        assert!(envelope.get("message").string().contains("worker-1"));
    }

    #[tokio::test]
    async fn node_listing_for_an_unknown_cluster_is_empty() {
        let (client, _coordinator) = test_server();
        let resp = client.get("/api/v1/clusters/staging/nodes").send().await;
        resp.assert_status_is_ok();

        let json = resp.json().await;
        let envelope = json.value().object();
        assert!(envelope.get("success").bool());
        assert_eq!(envelope.get("data").array().len(), 0);
    }

    #[tokio::test]
    async fn register_rejects_an_empty_cluster_name() {
        let (client, _coordinator) = test_server();
        let resp = client
            .post("/api/v1/clusters")
            .body_json(&RegisterClusterRequest {
                name: String::new(),
                kubeconfig: None,
            })
            .send()
            .await;
        resp.assert_status_is_ok();

        let json = resp.json().await;
        assert!(!json.value().object().get("success").bool());
    }

    #[tokio::test]
    async fn health_reset_reports_whether_state_existed() {
        let (client, coordinator) = test_server();

        let resp = client
            .post("/api/v1/clusters/prod-eu/health/reset")
            .send()
            .await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        assert!(
            !json.value().object().get("success").bool(),
            "nothing recorded yet, reset must report failure"
        );

        coordinator.health().record_failure("prod-eu", "timeout");
        let resp = client
            .post("/api/v1/clusters/prod-eu/health/reset")
            .send()
            .await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        assert!(json.value().object().get("success").bool());
        assert!(coordinator.health().all_health().is_empty());
    }

    #[tokio::test]
    async fn unregistering_an_unknown_cluster_still_succeeds() {
        let (client, _coordinator) = test_server();
        let resp = client.delete("/api/v1/clusters/prod-eu").send().await;
        resp.assert_status_is_ok();

        let json = resp.json().await;
        let envelope = json.value().object();
        assert!(envelope.get("success").bool());
        assert_eq!(envelope.get("data").string(), "prod-eu");
    }
}
