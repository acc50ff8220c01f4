use std::path::PathBuf;

use clap::Parser;
use utils::version;

/// Command line arguments for the fleetd daemon.
#[derive(Debug, Clone, Parser)]
#[command(about, version = &**version::VERSION)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "FLEETD_LISTEN_ADDR",
        default_value = "0.0.0.0:8700",
        help = "Address the HTTP API binds to, e.g. 0.0.0.0:8700"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        env = "FLEETD_FLEET_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file naming clusters to register on startup, e.g. /etc/fleetd/fleet.yaml"
    )]
    pub fleet_file: Option<PathBuf>,

    #[arg(
        long,
        env = "FLEETD_KUBECONFIG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory against which relative kubeconfig paths resolve"
    )]
    pub kubeconfig_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "FLEETD_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Daily-rolling log file; logs go to stderr only when unset"
    )]
    pub log_file: Option<PathBuf>,

    #[arg(
        long,
        env = "FLEETD_RESYNC_INTERVAL_SECS",
        default_value_t = 1800,
        help = "Seconds between forced watch restarts that re-list cluster state"
    )]
    pub resync_interval_secs: u64,

    #[arg(
        long,
        default_value_t = 30,
        help = "Seconds to wait for the initial node list of a newly registered cluster"
    )]
    pub node_sync_timeout_secs: u64,

    #[arg(
        long,
        default_value_t = 120,
        help = "Seconds to wait for the initial pod list of a newly registered cluster"
    )]
    pub pod_sync_timeout_secs: u64,

    #[arg(
        long,
        default_value_t = 3,
        help = "Consecutive failures before a cluster's circuit opens"
    )]
    pub failure_threshold: u32,

    #[arg(
        long,
        default_value_t = 2,
        help = "Base seconds for the exponential registration backoff"
    )]
    pub base_retry_delay_secs: u64,

    #[arg(
        long,
        default_value_t = 300,
        help = "Ceiling in seconds for the exponential registration backoff"
    )]
    pub max_retry_delay_secs: u64,

    #[arg(
        long,
        default_value_t = 30,
        help = "Seconds between WebSocket heartbeat pings"
    )]
    pub ping_interval_secs: u64,

    #[arg(
        long,
        default_value_t = 60,
        help = "Seconds of client silence before a stream is dropped"
    )]
    pub client_timeout_secs: u64,

    #[arg(
        long,
        default_value_t = 256,
        help = "Outbound message queue depth per WebSocket client"
    )]
    pub client_queue_depth: usize,
}
