use thiserror::Error;

/// Errors that can occur while watching a cluster.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to connect to cluster {cluster}: {message}")]
    ConnectionFailed { cluster: String, message: String },
    #[error("Watch stream for cluster {cluster} failed: {message}")]
    WatchFailed { cluster: String, message: String },
    #[error("Initial {resource} list for cluster {cluster} did not complete within {timeout_secs}s")]
    SyncTimeout {
        cluster: String,
        resource: &'static str,
        timeout_secs: u64,
    },
    #[error("Node watch for cluster {cluster} is not running, start it before watching pods")]
    NodeWatchNotStarted { cluster: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_cluster() {
        let timeout = WatchError::SyncTimeout {
            cluster: "prod-eu".to_string(),
            resource: "node",
            timeout_secs: 30,
        };
        assert_eq!(
            timeout.to_string(),
            "Initial node list for cluster prod-eu did not complete within 30s"
        );

        let not_started = WatchError::NodeWatchNotStarted {
            cluster: "prod-eu".to_string(),
        };
        assert!(not_started.to_string().contains("prod-eu"));
    }
}
