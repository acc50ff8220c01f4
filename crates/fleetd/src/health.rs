//! Per-cluster circuit breaker.
//!
//! Every outbound touch of a cluster is recorded here; registration and
//! reconnect paths consult [`ClusterHealthTracker::should_skip`] before
//! dialing out so a dead cluster is probed on a widening schedule instead
//! of being hammered.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use api_types::ClusterHealth;
use chrono::DateTime;
use chrono::Utc;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Backoff base; the delay doubles with each failure past the first.
    pub base_retry_delay: Duration,
    /// Backoff ceiling.
    pub max_retry_delay: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(300),
        }
    }
}

struct HealthEntry {
    healthy: bool,
    consecutive_failures: u32,
    circuit_open: bool,
    last_checked: Instant,
    last_checked_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl HealthEntry {
    fn fresh() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            circuit_open: false,
            last_checked: Instant::now(),
            last_checked_at: Utc::now(),
            last_error: None,
        }
    }
}

pub struct ClusterHealthTracker {
    config: HealthConfig,
    entries: RwLock<HashMap<String, HealthEntry>>,
}

impl ClusterHealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, cluster: &str) {
        let mut entries = self.entries.write().expect("poisoned");
        let was_open = entries
            .get(cluster)
            .is_some_and(|entry| entry.circuit_open);
        entries.insert(cluster.to_string(), HealthEntry::fresh());
        if was_open {
            info!(cluster = %cluster, "Circuit closed after a successful probe");
        }
    }

    pub fn record_failure(&self, cluster: &str, error: &str) {
        let mut entries = self.entries.write().expect("poisoned");
        let entry = entries
            .entry(cluster.to_string())
            .or_insert_with(HealthEntry::fresh);
        entry.healthy = false;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_checked = Instant::now();
        entry.last_checked_at = Utc::now();
        entry.last_error = Some(error.to_string());
        if !entry.circuit_open && entry.consecutive_failures >= self.config.failure_threshold {
            entry.circuit_open = true;
            warn!(
                cluster = %cluster,
                failures = entry.consecutive_failures,
                "Circuit opened: {error}"
            );
        } else {
            warn!(
                cluster = %cluster,
                failures = entry.consecutive_failures,
                "Cluster operation failed: {error}"
            );
        }
    }

    /// Whether an outbound call should be skipped right now.
    ///
    /// A never-seen cluster is always allowed. With failures on record the
    /// call is skipped while the backoff window is still running; once it
    /// elapses exactly the next probe goes through, and its outcome closes
    /// or re-opens the circuit.
    pub fn should_skip(&self, cluster: &str) -> bool {
        let entries = self.entries.read().expect("poisoned");
        let Some(entry) = entries.get(cluster) else {
            return false;
        };
        if entry.consecutive_failures == 0 {
            return false;
        }
        let delay = retry_delay(&self.config, entry.consecutive_failures);
        let skip = entry.last_checked.elapsed() < delay;
        if skip {
            debug!(
                cluster = %cluster,
                failures = entry.consecutive_failures,
                delay = ?delay,
                "Skipping cluster inside its backoff window"
            );
        }
        skip
    }

    /// Operator override: forget everything recorded about a cluster.
    pub fn reset(&self, cluster: &str) -> bool {
        let removed = self
            .entries
            .write()
            .expect("poisoned")
            .remove(cluster)
            .is_some();
        if removed {
            info!(cluster = %cluster, "Health state reset");
        }
        removed
    }

    pub fn health(&self, cluster: &str) -> Option<ClusterHealth> {
        self.entries
            .read()
            .expect("poisoned")
            .get(cluster)
            .map(|entry| view(cluster, entry))
    }

    pub fn all_health(&self) -> HashMap<String, ClusterHealth> {
        self.entries
            .read()
            .expect("poisoned")
            .iter()
            .map(|(cluster, entry)| (cluster.clone(), view(cluster, entry)))
            .collect()
    }
}

fn view(cluster: &str, entry: &HealthEntry) -> ClusterHealth {
    ClusterHealth {
        cluster_name: cluster.to_string(),
        healthy: entry.healthy,
        consecutive_failures: entry.consecutive_failures,
        circuit_open: entry.circuit_open,
        last_checked_at: entry.last_checked_at,
        last_error: entry.last_error.clone(),
    }
}

/// Zero for at most one failure, then `base * 2^(failures - 2)` capped.
fn retry_delay(config: &HealthConfig, failures: u32) -> Duration {
    if failures <= 1 {
        return Duration::ZERO;
    }
    let exponent = failures.saturating_sub(2).min(31);
    config
        .base_retry_delay
        .saturating_mul(2_u32.saturating_pow(exponent))
        .min(config.max_retry_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> HealthConfig {
        HealthConfig {
            failure_threshold: 3,
            base_retry_delay: Duration::from_millis(200),
            max_retry_delay: Duration::from_secs(300),
        }
    }

    #[test]
    fn retry_delay_doubles_past_the_first_failure() {
        let config = HealthConfig::default();
        assert_eq!(retry_delay(&config, 0), Duration::ZERO);
        assert_eq!(retry_delay(&config, 1), Duration::ZERO);
        assert_eq!(retry_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(retry_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(retry_delay(&config, 5), Duration::from_secs(16));
        assert_eq!(
            retry_delay(&config, 60),
            Duration::from_secs(300),
            "delay must cap instead of overflowing"
        );
    }

    #[test]
    fn circuit_opens_at_the_failure_threshold() {
        let tracker = ClusterHealthTracker::new(HealthConfig::default());
        tracker.record_failure("prod-eu", "connection refused");
        tracker.record_failure("prod-eu", "connection refused");
        let health = tracker.health("prod-eu").unwrap();
        assert!(!health.healthy);
        assert!(!health.circuit_open, "two failures stay under the threshold");

        tracker.record_failure("prod-eu", "connection refused");
        let health = tracker.health("prod-eu").unwrap();
        assert!(health.circuit_open);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn success_closes_the_circuit_and_clears_state() {
        let tracker = ClusterHealthTracker::new(HealthConfig::default());
        for _ in 0..4 {
            tracker.record_failure("prod-eu", "timeout");
        }
        tracker.record_success("prod-eu");

        let health = tracker.health("prod-eu").unwrap();
        assert!(health.healthy);
        assert!(!health.circuit_open);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_error.is_none());
        assert!(!tracker.should_skip("prod-eu"));
    }

    #[test]
    fn unknown_cluster_and_single_failure_are_never_skipped() {
        let tracker = ClusterHealthTracker::new(fast_config());
        assert!(!tracker.should_skip("prod-eu"));

        tracker.record_failure("prod-eu", "timeout");
        assert!(
            !tracker.should_skip("prod-eu"),
            "one failure carries a zero delay"
        );
    }

    #[test]
    fn backoff_window_skips_then_lets_one_probe_through() {
        let tracker = ClusterHealthTracker::new(fast_config());
        tracker.record_failure("prod-eu", "timeout");
        tracker.record_failure("prod-eu", "timeout");

        assert!(
            tracker.should_skip("prod-eu"),
            "second failure starts a 200ms window"
        );
        std::thread::sleep(Duration::from_millis(300));
        assert!(
            !tracker.should_skip("prod-eu"),
            "an elapsed window must let the next probe through"
        );
    }

    #[test]
    fn reset_forgets_the_cluster() {
        let tracker = ClusterHealthTracker::new(HealthConfig::default());
        tracker.record_failure("prod-eu", "timeout");

        assert!(tracker.reset("prod-eu"));
        assert!(tracker.health("prod-eu").is_none());
        assert!(!tracker.reset("prod-eu"), "second reset has nothing to clear");
    }

    #[test]
    fn all_health_returns_detached_copies() {
        let tracker = ClusterHealthTracker::new(HealthConfig::default());
        tracker.record_success("prod-eu");
        tracker.record_failure("prod-us", "tls handshake failed");

        let all = tracker.all_health();
        assert_eq!(all.len(), 2);
        assert!(all["prod-eu"].healthy);
        assert!(!all["prod-us"].healthy);
        assert_eq!(all["prod-us"].cluster_name, "prod-us");
    }
}
