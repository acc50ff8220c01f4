use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use api_types::ApiResponse;
use api_types::ClusterHealth;
use api_types::NodeSummary;
use api_types::RegisterClusterRequest;
use api_types::StatusSnapshot;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use tracing::info;
use tracing::warn;

use crate::coordinator::FleetCoordinator;
use crate::k8s::diff;

#[handler]
pub async fn ping() -> &'static str {
    "ok"
}

#[handler]
pub async fn get_status(
    coordinator: Data<&Arc<FleetCoordinator>>,
) -> Json<ApiResponse<StatusSnapshot>> {
    let snapshot = coordinator.status().await;
    Json(ApiResponse::ok(snapshot, "daemon status"))
}

/// Cached node list for one cluster joined with placement counts. Pod counts
/// are withheld while the cluster's placement index is not ready, so callers
/// can tell "zero pods" apart from "not yet counted".
#[handler]
pub async fn list_nodes(
    Path(cluster): Path<String>,
    coordinator: Data<&Arc<FleetCoordinator>>,
) -> Json<ApiResponse<Vec<NodeSummary>>> {
    let nodes = coordinator.node_cache().list(&cluster);
    let placement_ready = coordinator.placement().is_ready(&cluster);

    let summaries: Vec<NodeSummary> = nodes
        .iter()
        .map(|node| {
            let name = node.metadata.name.clone().unwrap_or_default();
            let pod_count =
                placement_ready.then(|| coordinator.placement().count(&cluster, &name));
            NodeSummary {
                status: diff::ready_status(node).to_string(),
                schedulable: diff::is_schedulable(node),
                pod_count,
                labels: node.metadata.labels.clone().unwrap_or_default(),
                name,
            }
        })
        .collect();

    let message = format!("{} nodes in cluster {cluster}", summaries.len());
    Json(ApiResponse::ok(summaries, message))
}

#[handler]
pub async fn get_node(
    Path((cluster, node)): Path<(String, String)>,
    coordinator: Data<&Arc<FleetCoordinator>>,
) -> Json<ApiResponse<serde_json::Value>> {
    let Some(snapshot) = coordinator.node_cache().get(&cluster, &node) else {
        warn!(cluster = %cluster, node = %node, "Node not found in cache");
        return Json(ApiResponse::err(format!(
            "Node {node} not found in cluster {cluster}"
        )));
    };
    match serde_json::to_value(snapshot.as_ref()) {
        Ok(body) => Json(ApiResponse::ok(
            body,
            format!("Node {node} retrieved successfully"),
        )),
        Err(e) => Json(ApiResponse::err(format!(
            "Failed to serialize node {node}: {e}"
        ))),
    }
}

#[handler]
pub async fn get_cluster_health(
    coordinator: Data<&Arc<FleetCoordinator>>,
) -> Json<ApiResponse<HashMap<String, ClusterHealth>>> {
    let health = coordinator.health().all_health();
    let message = format!("{} clusters tracked", health.len());
    Json(ApiResponse::ok(health, message))
}

#[handler]
pub async fn reset_cluster_health(
    Path(cluster): Path<String>,
    coordinator: Data<&Arc<FleetCoordinator>>,
) -> Json<ApiResponse<bool>> {
    if coordinator.health().reset(&cluster) {
        info!(cluster = %cluster, "Health state reset by operator");
        Json(ApiResponse::ok(
            true,
            format!("Health state for {cluster} cleared"),
        ))
    } else {
        Json(ApiResponse::err(format!(
            "No health state recorded for {cluster}"
        )))
    }
}

#[handler]
pub async fn register_cluster(
    Json(request): Json<RegisterClusterRequest>,
    coordinator: Data<&Arc<FleetCoordinator>>,
) -> Json<ApiResponse<String>> {
    if request.name.is_empty() {
        return Json(ApiResponse::err("Cluster name must not be empty"));
    }
    let kubeconfig = request.kubeconfig.map(PathBuf::from);
    match coordinator
        .register_cluster_from_kubeconfig(&request.name, kubeconfig)
        .await
    {
        Ok(()) => Json(ApiResponse::ok(
            request.name.clone(),
            format!("Cluster {} registered", request.name),
        )),
        Err(e) => {
            warn!(cluster = %request.name, "Cluster registration failed: {e:?}");
            Json(ApiResponse::err(e.current_context().to_string()))
        }
    }
}

#[handler]
pub async fn unregister_cluster(
    Path(cluster): Path<String>,
    coordinator: Data<&Arc<FleetCoordinator>>,
) -> Json<ApiResponse<String>> {
    coordinator.unregister_cluster(&cluster).await;
    Json(ApiResponse::ok(
        cluster.clone(),
        format!("Cluster {cluster} unregistered"),
    ))
}
