pub mod daemon;
pub mod fleet;

use std::time::Duration;

use crate::health::HealthConfig;
use crate::hub::HubConfig;
use crate::k8s::WatchConfig;

pub use daemon::*;
pub use fleet::*;

impl From<&daemon::DaemonArgs> for WatchConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            node_sync_timeout: Duration::from_secs(args.node_sync_timeout_secs),
            pod_sync_timeout: Duration::from_secs(args.pod_sync_timeout_secs),
            resync_interval: Duration::from_secs(args.resync_interval_secs),
            ..Self::default()
        }
    }
}

impl From<&daemon::DaemonArgs> for HealthConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            failure_threshold: args.failure_threshold,
            base_retry_delay: Duration::from_secs(args.base_retry_delay_secs),
            max_retry_delay: Duration::from_secs(args.max_retry_delay_secs),
        }
    }
}

impl From<&daemon::DaemonArgs> for HubConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            ping_interval: Duration::from_secs(args.ping_interval_secs),
            client_timeout: Duration::from_secs(args.client_timeout_secs),
            client_queue_depth: args.client_queue_depth,
            ..Self::default()
        }
    }
}
