use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    error::AppError,
    host::Host,
    model::ClusterHandle,
    runner::Provisioner,
    utils::run_captured,
};

const KIND_CONFIG_CANDIDATES: [&str; 2] = ["kind-config.yaml", "kind-config.yml"];

impl From<bollard::errors::Error> for AppError {
    fn from(err: bollard::errors::Error) -> Self {
        AppError::unavailable("docker", err.to_string())
    }
}

/// Provisions local clusters with `kind`.
pub struct Kind<'a> {
    host: &'a dyn Host,
}

impl<'a> Kind<'a> {
    pub fn new(host: &'a dyn Host) -> Self {
        Self { host }
    }

    fn kind_binary(&self) -> Result<PathBuf, AppError> {
        self.host
            .resolve("kind")
            .ok_or_else(|| AppError::unavailable("kind", "not found in PATH"))
    }

    pub async fn delete(&self, name: &str) -> Result<(), AppError> {
        let kind = self.kind_binary()?;
        run_captured(&kind, &["delete", "cluster", "--name", name]).await?;
        info!(cluster = name, "kind cluster deleted");
        Ok(())
    }
}

#[async_trait]
impl Provisioner for Kind<'_> {
    async fn preflight(&self) -> Result<(), AppError> {
        self.kind_binary()?;

        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        Ok(())
    }

    async fn create(
        &self,
        name: &str,
        config_file: Option<&Path>,
        kubeconfig_path: &Path,
    ) -> Result<ClusterHandle, AppError> {
        let kind = self.kind_binary()?;

        if let Some(parent) = kubeconfig_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::io("failed to create kubeconfig directory", parent, e))?;
        }

        let kubeconfig = kubeconfig_path.to_string_lossy();
        let mut args = vec![
            "create",
            "cluster",
            "--name",
            name,
            "--kubeconfig",
            kubeconfig.as_ref(),
        ];
        let config = config_file.map(|p| p.to_string_lossy());
        if let Some(config) = config.as_deref() {
            args.extend(["--config", config]);
        }

        run_captured(&kind, &args).await?;
        info!(cluster = name, kubeconfig = %kubeconfig, "kind cluster created");

        Ok(ClusterHandle {
            name: name.to_string(),
            kubeconfig_path: kubeconfig_path.to_path_buf(),
        })
    }
}

/// Picks the kind config to use. An explicit path wins if it exists;
/// otherwise `dir` is searched for the usual file names.
pub fn resolve_kind_config(explicit: Option<&Path>, dir: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            info!(path = %path.display(), "using kind config from flag");
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "provided kind config not found; ignoring");
        return None;
    }

    match find_kind_config(dir) {
        Some(path) => {
            info!(path = %path.display(), "found kind config");
            Some(path)
        }
        None => {
            info!("no kind config file found; proceeding without one");
            None
        }
    }
}

fn find_kind_config(dir: &Path) -> Option<PathBuf> {
    for name in KIND_CONFIG_CANDIDATES {
        let path = dir.join(name);
        if path.is_file() {
            return Some(path);
        }
    }

    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.starts_with("kind") && (name.ends_with(".yaml") || name.ends_with(".yml"))
        })
        .map(|entry| entry.into_path())
}

/// Where the kubeconfig of a cluster lives under the working directory.
pub fn kubeconfig_path(directory: &Path, cluster_name: &str) -> PathBuf {
    directory
        .join("clusters")
        .join(cluster_name)
        .join("kubeconfig")
}
