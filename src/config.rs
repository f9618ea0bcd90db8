//! Run settings.
//!
//! Sources, highest priority first: command-line flags and `K8S_LOCAL_BENCH_*`
//! environment variables (both handled by clap), the YAML config file, then
//! the built-in defaults below.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{balancer::BalancerConfig, error::AppError};

const CONFIG_FILE_NAME: &str = ".k8s-local-bench.yaml";

pub const DEFAULT_CLUSTER_NAME: &str = "local-bench";
pub const DEFAULT_DOMAIN: &str = "k8s-bench.local";
pub const DEFAULT_NAMESPACE: &str = "haproxy-controller";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Working directory holding kind configs and generated kubeconfigs.
    pub directory: PathBuf,
    pub debug: bool,
    pub cluster_name: String,
    pub domain: String,
    pub namespace: String,
    /// Hostnames under `domain` advertised once the cluster is up.
    pub hosts: Vec<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub balancer_binary: String,
    pub elevation_tool: String,
    pub dnsmasq_config: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            debug: false,
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            hosts: vec!["argocd".to_string(), "headlamp".to_string()],
            timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(5),
            balancer_binary: "cloud-provider-kind".to_string(),
            elevation_tool: "sudo".to_string(),
            dnsmasq_config: None,
        }
    }
}

/// Shape of the YAML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
struct FileConfig {
    directory: Option<PathBuf>,
    debug: Option<bool>,
    cluster_name: Option<String>,
    domain: Option<String>,
    namespace: Option<String>,
    hosts: Option<Vec<String>>,
    timeout_seconds: Option<u64>,
    poll_interval_seconds: Option<u64>,
    balancer_binary: Option<String>,
    elevation_tool: Option<String>,
    dnsmasq_config: Option<PathBuf>,
}

impl Settings {
    /// Loads settings from `path`, or from `~/.k8s-local-bench.yaml` when no
    /// path is given. Only a missing default file is tolerated.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let file = match path {
            Some(path) => read_file_config(path)?,
            None => match default_config_path() {
                Some(path) => match read_file_config(&path) {
                    Err(AppError::Io { source, .. })
                        if source.kind() == io::ErrorKind::NotFound =>
                    {
                        FileConfig::default()
                    }
                    other => other?,
                },
                None => FileConfig::default(),
            },
        };
        Ok(Settings::default().merge(file))
    }

    fn merge(self, file: FileConfig) -> Self {
        Self {
            directory: file.directory.unwrap_or(self.directory),
            debug: file.debug.unwrap_or(self.debug),
            cluster_name: file.cluster_name.unwrap_or(self.cluster_name),
            domain: file.domain.unwrap_or(self.domain),
            namespace: file.namespace.unwrap_or(self.namespace),
            hosts: file.hosts.unwrap_or(self.hosts),
            timeout: file
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.timeout),
            poll_interval: file
                .poll_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.poll_interval),
            balancer_binary: file.balancer_binary.unwrap_or(self.balancer_binary),
            elevation_tool: file.elevation_tool.unwrap_or(self.elevation_tool),
            dnsmasq_config: file.dnsmasq_config.or(self.dnsmasq_config),
        }
    }

    pub fn balancer_config(&self) -> BalancerConfig {
        BalancerConfig {
            binary: self.balancer_binary.clone(),
            elevation_tool: self.elevation_tool.clone(),
            ..BalancerConfig::default()
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
}

fn read_file_config(path: &Path) -> Result<FileConfig, AppError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| AppError::io("failed to read config file", path, e))?;
    if data.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml::from_str(&data).map_err(|e| {
        AppError::invalid_argument(format!("invalid config file {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.yaml");
        fs::write(
            &path,
            "debug: true\ncluster-name: dev\nhosts: [grafana]\ntimeout-seconds: 90\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();

        assert!(settings.debug);
        assert_eq!(settings.cluster_name, "dev");
        assert_eq!(settings.hosts, vec!["grafana"]);
        assert_eq!(settings.timeout, Duration::from_secs(90));
        assert_eq!(settings.domain, DEFAULT_DOMAIN);
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.yaml");
        fs::write(&path, "\n").unwrap();

        assert_eq!(Settings::load(Some(&path)).unwrap(), Settings::default());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("absent.yaml"))).unwrap_err();
        assert!(matches!(err, AppError::Io { .. }));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.yaml");
        fs::write(&path, "cluster-nmae: typo\n").unwrap();

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(ref m) if m.contains("bench.yaml")));
    }

    #[test]
    fn balancer_config_carries_overrides() {
        let settings = Settings {
            balancer_binary: "/opt/bin/cloud-provider-kind".to_string(),
            elevation_tool: "doas".to_string(),
            ..Settings::default()
        };

        let config = settings.balancer_config();

        assert_eq!(config.binary, "/opt/bin/cloud-provider-kind");
        assert_eq!(config.elevation_tool, "doas");
        assert_eq!(config.toolchain, "go");
    }
}
