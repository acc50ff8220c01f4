//! Composition root tying watch sessions to the state stores, the health
//! tracker and the notification hub.

use std::path::PathBuf;
use std::sync::Arc;

use api_types::StatusSnapshot;
use error_stack::Report;
use kube::Client;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::health::ClusterHealthTracker;
use crate::health::HealthConfig;
use crate::hub::HubHandle;
use crate::hub::NodeEventProjector;
use crate::k8s::client::init_cluster_client;
use crate::k8s::FleetWatcher;
use crate::k8s::WatchConfig;
use crate::state::node_cache::NodeStateCache;
use crate::state::placement::PlacementIndex;

/// Errors from cluster registration.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Cluster {cluster} is inside its backoff window, try again later")]
    CircuitOpen { cluster: String },
    #[error("Failed to build a client for cluster {cluster}")]
    ClientBuild { cluster: String },
    #[error("Failed to start watching cluster {cluster}")]
    WatchStart { cluster: String },
}

/// Owns every long-lived component and drives cluster lifecycle.
pub struct FleetCoordinator {
    watcher: Arc<FleetWatcher>,
    node_cache: Arc<NodeStateCache>,
    placement: Arc<PlacementIndex>,
    health: Arc<ClusterHealthTracker>,
    hub: HubHandle,
    kubeconfig_dir: Option<PathBuf>,
}

impl FleetCoordinator {
    /// Wire the event pipeline: node events feed the cache first and the
    /// stream projector second, pod events feed the placement index.
    pub fn new(
        watch_config: WatchConfig,
        health_config: HealthConfig,
        hub: HubHandle,
        kubeconfig_dir: Option<PathBuf>,
    ) -> Self {
        let node_cache = Arc::new(NodeStateCache::new());
        let placement = Arc::new(PlacementIndex::new());
        let health = Arc::new(ClusterHealthTracker::new(health_config));

        let mut watcher = FleetWatcher::new(watch_config);
        watcher.register_node_handler(node_cache.clone());
        watcher.register_node_handler(Arc::new(NodeEventProjector::new(hub.clone())));
        watcher.register_pod_handler(placement.clone());

        Self {
            watcher: Arc::new(watcher),
            node_cache,
            placement,
            health,
            hub,
            kubeconfig_dir,
        }
    }

    pub fn node_cache(&self) -> &NodeStateCache {
        &self.node_cache
    }

    pub fn placement(&self) -> &PlacementIndex {
        &self.placement
    }

    pub fn health(&self) -> &ClusterHealthTracker {
        &self.health
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Register a cluster and bring its watches up.
    ///
    /// A failed node watch start rolls everything back: the session, cache
    /// entries and placement counters. Registration never leaves partial
    /// state behind. The pod watch is best-effort; without it the cluster's
    /// placement index simply stays not-ready and callers fall back.
    #[tracing::instrument(skip(self, client))]
    pub async fn register_cluster(
        &self,
        cluster: &str,
        client: Client,
    ) -> Result<(), Report<RegistrationError>> {
        if self.health.should_skip(cluster) {
            return Err(Report::new(RegistrationError::CircuitOpen {
                cluster: cluster.to_string(),
            }));
        }

        let inventory = match self.watcher.start_node_watch(cluster, client).await {
            Ok(inventory) => inventory,
            Err(e) => {
                self.health
                    .record_failure(cluster, &e.current_context().to_string());
                // events may have landed while the initial list was in flight
                self.node_cache.invalidate_cluster(cluster);
                self.placement.invalidate_cluster(cluster);
                return Err(e.change_context(RegistrationError::WatchStart {
                    cluster: cluster.to_string(),
                }));
            }
        };

        self.node_cache.seed(cluster, inventory);
        self.health.record_success(cluster);

        match self.watcher.start_pod_watch(cluster).await {
            Ok(()) => self.placement.mark_synced(cluster),
            Err(e) => {
                warn!(
                    cluster = %cluster,
                    "Pod watch unavailable, per-node pod counts stay not-ready: {e:?}"
                );
            }
        }

        info!(cluster = %cluster, "Cluster registered");
        Ok(())
    }

    /// Register by kubeconfig path; no path means in-cluster or default
    /// credentials.
    pub async fn register_cluster_from_kubeconfig(
        &self,
        cluster: &str,
        kubeconfig: Option<PathBuf>,
    ) -> Result<(), Report<RegistrationError>> {
        if self.health.should_skip(cluster) {
            return Err(Report::new(RegistrationError::CircuitOpen {
                cluster: cluster.to_string(),
            }));
        }
        let kubeconfig = self.resolve_kubeconfig(kubeconfig);
        let client = match init_cluster_client(cluster, kubeconfig).await {
            Ok(client) => client,
            Err(e) => {
                self.health
                    .record_failure(cluster, &e.current_context().to_string());
                return Err(e.change_context(RegistrationError::ClientBuild {
                    cluster: cluster.to_string(),
                }));
            }
        };
        self.register_cluster(cluster, client).await
    }

    /// Relative kubeconfig paths resolve against the configured directory.
    fn resolve_kubeconfig(&self, kubeconfig: Option<PathBuf>) -> Option<PathBuf> {
        match (kubeconfig, self.kubeconfig_dir.as_deref()) {
            (Some(path), Some(dir)) if path.is_relative() => Some(dir.join(path)),
            (kubeconfig, _) => kubeconfig,
        }
    }

    /// Stop watching a cluster and drop its derived state. Stream
    /// subscriptions are left alone; clients may outlive the registration.
    pub async fn unregister_cluster(&self, cluster: &str) {
        self.watcher.stop(cluster).await;
        self.node_cache.invalidate_cluster(cluster);
        self.placement.invalidate_cluster(cluster);
        info!(cluster = %cluster, "Cluster unregistered");
    }

    pub async fn status(&self) -> StatusSnapshot {
        let watchers = self.watcher.watch_status();
        StatusSnapshot {
            cluster_count: watchers.len(),
            watchers,
            cache: self.node_cache.stats(),
            placement: self.placement.stats(),
            hub: self.hub.stats().await,
        }
    }

    pub async fn shutdown(&self) {
        self.watcher.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::hub::HubConfig;
    use crate::hub::NotificationHub;

    fn coordinator_with_hub() -> (FleetCoordinator, NotificationHub) {
        let (hub, handle) = NotificationHub::new(HubConfig::default());
        let coordinator = FleetCoordinator::new(
            WatchConfig::default(),
            HealthConfig::default(),
            handle,
            None,
        );
        (coordinator, hub)
    }

    #[test]
    fn relative_kubeconfig_paths_resolve_against_the_directory() {
        let (hub, handle) = NotificationHub::new(HubConfig::default());
        drop(hub);
        let coordinator = FleetCoordinator::new(
            WatchConfig::default(),
            HealthConfig::default(),
            handle,
            Some(PathBuf::from("/etc/fleetd/kubeconfigs")),
        );

        assert_eq!(
            coordinator.resolve_kubeconfig(Some(PathBuf::from("prod-eu.yaml"))),
            Some(PathBuf::from("/etc/fleetd/kubeconfigs/prod-eu.yaml"))
        );
        assert_eq!(
            coordinator.resolve_kubeconfig(Some(PathBuf::from("/abs/other.yaml"))),
            Some(PathBuf::from("/abs/other.yaml")),
            "absolute paths pass through untouched"
        );
        assert_eq!(coordinator.resolve_kubeconfig(None), None);
    }

    #[tokio::test]
    async fn failed_client_build_is_recorded_and_backs_off() {
        let (coordinator, _hub) = coordinator_with_hub();
        let missing = PathBuf::from("/nonexistent/kubeconfig.yaml");

        let err = coordinator
            .register_cluster_from_kubeconfig("prod-eu", Some(missing.clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            RegistrationError::ClientBuild { .. }
        ));
        let health = coordinator.health().health("prod-eu").unwrap();
        assert!(!health.healthy);
        assert_eq!(health.consecutive_failures, 1);

        // a second failure opens a two second backoff window
        let _ = coordinator
            .register_cluster_from_kubeconfig("prod-eu", Some(missing.clone()))
            .await;
        let err = coordinator
            .register_cluster_from_kubeconfig("prod-eu", Some(missing))
            .await
            .unwrap_err();
        assert!(
            matches!(err.current_context(), RegistrationError::CircuitOpen { .. }),
            "inside the backoff window the cluster must not be touched"
        );
        assert_eq!(
            coordinator
                .health()
                .health("prod-eu")
                .unwrap()
                .consecutive_failures,
            2,
            "a skipped attempt is not a probe and must not count as a failure"
        );
    }

    #[tokio::test]
    async fn status_reflects_an_empty_daemon() {
        let (coordinator, hub) = coordinator_with_hub();
        let token = CancellationToken::new();
        let hub_task = tokio::spawn(hub.run(token.clone()));

        coordinator.unregister_cluster("never-registered").await;

        let status = coordinator.status().await;
        assert_eq!(status.cluster_count, 0);
        assert!(status.watchers.is_empty());
        assert_eq!(status.cache.node_count, 0);
        assert_eq!(status.placement.tracked_pods, 0);
        assert_eq!(status.hub.client_count, 0);

        token.cancel();
        let _ = hub_task.await;
    }
}
