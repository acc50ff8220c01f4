use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::hub::NotificationHub;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &mut Application) -> Result<()> {
        // Start notification hub task
        if let Some(hub) = app.take_hub() {
            let hub_task = self.spawn_hub_task(hub);
            self.tasks.push(hub_task);
        }

        // Start API server task
        let api_server_task = self.spawn_api_server_task(app);
        self.tasks.push(api_server_task);

        // Register fleet file clusters; detached so an unreachable cluster
        // cannot hold up or take down the daemon
        self.spawn_startup_registration(app);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        // Set up signal handling for graceful shutdown
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::signal;
                use tokio::signal::unix::SignalKind;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    tokio::signal::ctrl_c()
                        .await
                        .expect("Failed to install Ctrl+C handler");
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            // Wait for shutdown signal
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();

                // Wait for all tasks with timeout
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            // Wait for any task to complete unexpectedly
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_hub_task(&self, hub: NotificationHub) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting notification hub task");
            hub.run(token).await;
            tracing::info!("Notification hub task completed");
        })
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let cli = app.daemon_args();
        let listen_addr = cli.listen_addr.clone();
        let coordinator = app.coordinator().clone();
        let hub = app.hub_handle().clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting API server on {}", listen_addr);

            let api_server = crate::api::server::ApiServer::new(coordinator, hub, listen_addr);

            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {}", e);
            } else {
                tracing::info!("API server completed");
            }
        })
    }

    fn spawn_startup_registration(&self, app: &mut Application) {
        let clusters = app.take_startup_clusters();
        if clusters.is_empty() {
            return;
        }

        let coordinator = app.coordinator().clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Registering {} startup clusters", clusters.len());
            for cluster in clusters {
                if token.is_cancelled() {
                    break;
                }
                if let Err(e) = coordinator
                    .register_cluster_from_kubeconfig(&cluster.name, cluster.kubeconfig.clone())
                    .await
                {
                    tracing::warn!("Startup registration failed for {}: {e:?}", cluster.name);
                }
            }
        });
    }
}
