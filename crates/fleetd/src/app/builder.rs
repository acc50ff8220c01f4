use std::sync::Arc;

use anyhow::Result;

use crate::app::Application;
use crate::config::load_fleet_file;
use crate::config::DaemonArgs;
use crate::config::FleetCluster;
use crate::coordinator::FleetCoordinator;
use crate::health::HealthConfig;
use crate::hub::HubConfig;
use crate::hub::NotificationHub;
use crate::k8s::WatchConfig;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    /// Create new application builder
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let startup_clusters = self.load_startup_clusters()?;

        let (hub, hub_handle) = NotificationHub::new(HubConfig::from(&self.daemon_args));
        let coordinator = Arc::new(FleetCoordinator::new(
            WatchConfig::from(&self.daemon_args),
            HealthConfig::from(&self.daemon_args),
            hub_handle.clone(),
            self.daemon_args.kubeconfig_dir.clone(),
        ));

        Ok(Application::new(
            coordinator,
            hub,
            hub_handle,
            self.daemon_args,
            startup_clusters,
        ))
    }

    /// An unreadable fleet file is fatal; an absent one means no startup
    /// clusters
    fn load_startup_clusters(&self) -> Result<Vec<FleetCluster>> {
        let Some(path) = self.daemon_args.fleet_file.as_deref() else {
            return Ok(Vec::new());
        };

        let fleet = load_fleet_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load fleet file: {e:?}"))?;
        tracing::info!(
            "Fleet file {} lists {} clusters",
            path.display(),
            fleet.clusters.len()
        );
        Ok(fleet.clusters)
    }
}
