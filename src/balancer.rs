use std::{
    env,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, process::Command};
use tracing::{debug, info};

use crate::{
    error::AppError,
    host::Host,
    model::BalancerProcess,
    runner::BalancerLauncher,
    utils::{run_captured, run_interactive},
};

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Balancer executable, resolved on `PATH`.
    pub binary: String,
    /// Toolchain used to build the balancer when it is missing.
    pub toolchain: String,
    pub install_args: Vec<String>,
    /// sudo-compatible tool: `-v` validates credentials, `-n` never prompts.
    pub elevation_tool: String,
    pub log_dir: PathBuf,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            binary: "cloud-provider-kind".to_string(),
            toolchain: "go".to_string(),
            install_args: vec![
                "install".to_string(),
                "sigs.k8s.io/cloud-provider-kind@latest".to_string(),
            ],
            elevation_tool: "sudo".to_string(),
            log_dir: env::temp_dir(),
        }
    }
}

/// How the balancer can obtain the privileges it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elevation {
    /// Already running privileged.
    NotRequired,
    /// Needs to go through the elevation tool at this path.
    Available(PathBuf),
    Unavailable,
}

/// Installs and launches the load balancer process.
pub struct Supervisor<'a> {
    host: &'a dyn Host,
    config: BalancerConfig,
}

impl<'a> Supervisor<'a> {
    pub fn new(host: &'a dyn Host, config: BalancerConfig) -> Self {
        Self { host, config }
    }

    pub fn elevation(&self) -> Elevation {
        if self.host.is_privileged() {
            return Elevation::NotRequired;
        }
        match self.host.resolve(&self.config.elevation_tool) {
            Some(tool) => Elevation::Available(tool),
            None => Elevation::Unavailable,
        }
    }

    /// Log file of the detached balancer for `cluster_name`. Stable across
    /// runs so repeated launches append to the same file.
    pub fn log_path(&self, cluster_name: &str) -> PathBuf {
        let binary = Path::new(&self.config.binary)
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| self.config.binary.as_str().into());
        self.config
            .log_dir
            .join(format!("{binary}-{cluster_name}.log"))
    }

    pub async fn ensure_installed(&self) -> Result<PathBuf, AppError> {
        let binary = &self.config.binary;
        if let Some(path) = self.host.resolve(binary) {
            debug!(path = %path.display(), "{binary} already installed");
            return Ok(path);
        }

        let toolchain = self.host.resolve(&self.config.toolchain).ok_or_else(|| {
            AppError::unavailable(
                binary.as_str(),
                format!(
                    "not found in PATH and {} is not installed to build it",
                    self.config.toolchain
                ),
            )
        })?;

        info!("{binary} not found, installing with {}", self.config.toolchain);
        let args: Vec<&str> = self.config.install_args.iter().map(String::as_str).collect();
        let output = run_captured(&toolchain, &args)
            .await
            .map_err(|e| AppError::unavailable(binary.as_str(), format!("install failed: {e}")))?;

        let path = self.host.resolve(binary).ok_or_else(|| {
            AppError::unavailable(
                binary.as_str(),
                format!("not found in PATH after install; output: {}", output.trim()),
            )
        })?;
        info!(path = %path.display(), "{binary} installed");
        Ok(path)
    }

    pub async fn start(
        &self,
        cluster_name: &str,
        background: bool,
    ) -> Result<BalancerProcess, AppError> {
        let binary = self.host.resolve(&self.config.binary).ok_or_else(|| {
            AppError::unavailable(self.config.binary.as_str(), "not found in PATH")
        })?;

        let elevate = match self.elevation() {
            Elevation::NotRequired => None,
            Elevation::Available(tool) => Some(tool),
            Elevation::Unavailable => {
                return Err(AppError::PermissionDenied(format!(
                    "{} needs elevated privileges but {} is not installed",
                    self.config.binary, self.config.elevation_tool
                )));
            }
        };

        if background {
            self.launch_detached(cluster_name, &binary, elevate.as_deref())
                .await
        } else {
            self.run_foreground(&binary, elevate.as_deref()).await
        }
    }

    async fn run_foreground(
        &self,
        binary: &Path,
        elevate: Option<&Path>,
    ) -> Result<BalancerProcess, AppError> {
        info!(binary = %binary.display(), "running load balancer in foreground");
        match elevate {
            Some(tool) => {
                let binary = binary.to_string_lossy();
                run_interactive(tool, &[binary.as_ref()]).await?;
            }
            None => {
                run_captured(binary, &[]).await?;
            }
        }

        Ok(BalancerProcess {
            pid: None,
            log_file_path: None,
            detached: false,
            privileged: elevate.is_some(),
        })
    }

    async fn launch_detached(
        &self,
        cluster_name: &str,
        binary: &Path,
        elevate: Option<&Path>,
    ) -> Result<BalancerProcess, AppError> {
        if let Some(tool) = elevate {
            run_interactive(tool, &["-v"]).await.map_err(|e| {
                AppError::PermissionDenied(format!("privilege validation failed: {e}"))
            })?;
        }

        let log_path = self.log_path(cluster_name);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| AppError::io("failed to open balancer log", &log_path, e))?
            .into_std()
            .await;
        let log_err = log
            .try_clone()
            .map_err(|e| AppError::io("failed to open balancer log", &log_path, e))?;

        let mut command = match elevate {
            Some(tool) => {
                let mut command = std::process::Command::new(tool);
                command.arg("-n").arg(binary);
                command
            }
            None => std::process::Command::new(binary),
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        // own process group so the balancer outlives this CLI
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let child = Command::from(command).spawn().map_err(|source| AppError::LaunchFailed {
            program: binary.display().to_string(),
            source,
        })?;
        let pid = child.id();

        info!(
            log = %log_path.display(),
            pid = pid.unwrap_or_default(),
            "load balancer started in background"
        );

        Ok(BalancerProcess {
            pid,
            log_file_path: Some(log_path),
            detached: true,
            privileged: elevate.is_some(),
        })
    }
}

#[async_trait]
impl BalancerLauncher for Supervisor<'_> {
    async fn ensure_installed(&self) -> Result<(), AppError> {
        Supervisor::ensure_installed(self).await.map(|_| ())
    }

    async fn start(
        &self,
        cluster_name: &str,
        background: bool,
    ) -> Result<BalancerProcess, AppError> {
        Supervisor::start(self, cluster_name, background).await
    }
}
