use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::k8s::error::WatchError;

/// Build an API client for one cluster from an optional kubeconfig path.
///
/// Without a path the default chain applies: in-cluster service account
/// credentials or `~/.kube/config`.
pub async fn init_cluster_client(
    cluster: &str,
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<WatchError>> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig =
                Kubeconfig::read_from(&path).change_context(WatchError::ConnectionFailed {
                    cluster: cluster.to_string(),
                    message: format!("failed to read kubeconfig file: {}", path.display()),
                })?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(WatchError::ConnectionFailed {
                    cluster: cluster.to_string(),
                    message: format!("failed to build client config from {}", path.display()),
                })?;

            Client::try_from(config).change_context(WatchError::ConnectionFailed {
                cluster: cluster.to_string(),
                message: "failed to create Kubernetes client from kubeconfig".to_string(),
            })
        }
        None => Client::try_default()
            .await
            .change_context(WatchError::ConnectionFailed {
                cluster: cluster.to_string(),
                message: "failed to create Kubernetes client from default config".to_string(),
            }),
    }
}
