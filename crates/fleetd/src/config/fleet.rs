use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read fleet file {}", path.display())]
    Read { path: PathBuf },
    #[error("failed to parse fleet file {}", path.display())]
    Parse { path: PathBuf },
}

/// Clusters to register when the daemon boots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetFile {
    #[serde(default)]
    pub clusters: Vec<FleetCluster>,
}

/// One startup cluster entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetCluster {
    /// Cluster name, unique within the daemon
    pub name: String,
    /// Kubeconfig path; default credentials apply when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

/// Load the startup fleet file.
///
/// # Errors
///
/// - [`ConfigError::Read`] if the file cannot be read
/// - [`ConfigError::Parse`] if the YAML does not match the schema
pub fn load_fleet_file(path: &Path) -> Result<FleetFile, Report<ConfigError>> {
    let raw = std::fs::read_to_string(path).change_context(ConfigError::Read {
        path: path.to_path_buf(),
    })?;
    serde_yaml::from_str(&raw).change_context(ConfigError::Parse {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn fleet_file_parses_clusters_with_optional_kubeconfig() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "clusters:").expect("write");
        writeln!(file, "  - name: prod-eu").expect("write");
        writeln!(file, "    kubeconfig: /etc/fleetd/prod-eu.yaml").expect("write");
        writeln!(file, "  - name: staging").expect("write");

        let fleet = load_fleet_file(file.path()).expect("load");
        assert_eq!(fleet.clusters.len(), 2);
        assert_eq!(fleet.clusters[0].name, "prod-eu");
        assert_eq!(
            fleet.clusters[0].kubeconfig.as_deref(),
            Some(Path::new("/etc/fleetd/prod-eu.yaml"))
        );
        assert!(fleet.clusters[1].kubeconfig.is_none());
    }

    #[test]
    fn empty_document_yields_no_clusters() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "{{}}").expect("write");

        let fleet = load_fleet_file(file.path()).expect("load");
        assert!(fleet.clusters.is_empty());
    }

    #[test]
    fn missing_file_reports_the_path() {
        let report = load_fleet_file(Path::new("/nonexistent/fleet.yaml")).expect_err("must fail");
        assert!(report.to_string().contains("/nonexistent/fleet.yaml"));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "clusters: [[[").expect("write");

        let report = load_fleet_file(file.path()).expect_err("must fail");
        assert!(matches!(report.current_context(), ConfigError::Parse { .. }));
    }
}
