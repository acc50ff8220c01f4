use std::sync::Arc;

use anyhow::Result;

use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;
use crate::config::FleetCluster;
use crate::coordinator::FleetCoordinator;
use crate::hub::HubHandle;
use crate::hub::NotificationHub;

/// Application core structure with explicit dependencies
pub struct Application {
    coordinator: Arc<FleetCoordinator>,
    hub: Option<NotificationHub>,
    hub_handle: HubHandle,
    daemon_args: DaemonArgs,
    startup_clusters: Vec<FleetCluster>,
}

impl Application {
    /// Create new application with explicit dependencies
    pub fn new(
        coordinator: Arc<FleetCoordinator>,
        hub: NotificationHub,
        hub_handle: HubHandle,
        daemon_args: DaemonArgs,
        startup_clusters: Vec<FleetCluster>,
    ) -> Self {
        Self {
            coordinator,
            hub: Some(hub),
            hub_handle,
            daemon_args,
            startup_clusters,
        }
    }

    /// Get the cluster coordinator
    pub fn coordinator(&self) -> &Arc<FleetCoordinator> {
        &self.coordinator
    }

    /// Get the notification hub handle
    pub fn hub_handle(&self) -> &HubHandle {
        &self.hub_handle
    }

    /// Get daemon arguments
    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Take the hub actor for spawning; it runs at most once
    pub(super) fn take_hub(&mut self) -> Option<NotificationHub> {
        self.hub.take()
    }

    /// Take the clusters the fleet file asks to register at boot
    pub(super) fn take_startup_clusters(&mut self) -> Vec<FleetCluster> {
        std::mem::take(&mut self.startup_clusters)
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        // Create task manager
        let mut tasks = Tasks::new();

        // Start all background tasks
        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn application tasks: {}", e);
            return Err(e);
        }

        // Wait for tasks to complete or receive shutdown signal
        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Gracefully shutdown application
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");

        // Stop all watch sessions and drop their derived state
        self.coordinator.shutdown().await;

        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
