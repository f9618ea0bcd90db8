use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    discovery::{ServiceQuery, wait_for_load_balancer_address},
    error::AppError,
    model::{BalancerProcess, ClusterHandle, ServiceRecord},
};

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Checks that cluster creation can work before anything is created.
    async fn preflight(&self) -> Result<(), AppError>;

    async fn create(
        &self,
        name: &str,
        config_file: Option<&Path>,
        kubeconfig_path: &Path,
    ) -> Result<ClusterHandle, AppError>;
}

#[async_trait]
pub trait BalancerLauncher: Send + Sync {
    async fn ensure_installed(&self) -> Result<(), AppError>;

    async fn start(
        &self,
        cluster_name: &str,
        background: bool,
    ) -> Result<BalancerProcess, AppError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, cluster: &ClusterHandle) -> Result<Box<dyn ServiceQuery>, AppError>;
}

#[async_trait]
pub trait DomainSync: Send + Sync {
    /// Returns the resolver config path that was updated.
    async fn ensure_domain_ip(&self, domain: &str, ip: &str) -> Result<PathBuf, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    ClusterCreating,
    BalancerStarting,
    AwaitingAddress,
    SyncingDns,
    Ready,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "preflight",
            Phase::ClusterCreating => "cluster creation",
            Phase::BalancerStarting => "load balancer start",
            Phase::AwaitingAddress => "load balancer address discovery",
            Phase::SyncingDns => "DNS sync",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("bootstrap failed during {phase}: {source}")]
pub struct BootstrapError {
    pub phase: Phase,
    #[source]
    pub source: AppError,
}

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub cluster_name: String,
    pub kind_config: Option<PathBuf>,
    pub kubeconfig_path: PathBuf,
    pub start_balancer: bool,
    pub balancer_foreground: bool,
    /// Namespace of the LoadBalancer Service fronting the cluster.
    pub namespace: String,
    pub domain: String,
    pub hosts: Vec<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub skip_dns: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum Outcome {
    Ready,
    /// Converged, but the resolver may still serve a stale address.
    Degraded { warning: String },
    /// The foreground balancer exited; nothing after it ran.
    BalancerExited,
    DnsSkipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub cluster: ClusterHandle,
    pub balancer: Option<BalancerProcess>,
    pub service: Option<ServiceRecord>,
    #[serde(rename = "dnsConfig")]
    pub dns_config: Option<PathBuf>,
    pub urls: Vec<Url>,
    pub outcome: Outcome,
}

impl Report {
    fn new(cluster: ClusterHandle, balancer: Option<BalancerProcess>, outcome: Outcome) -> Self {
        Self {
            cluster,
            balancer,
            service: None,
            dns_config: None,
            urls: vec![],
            outcome,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        match &self.outcome {
            Outcome::BalancerExited => {
                let name = &self.cluster.name;
                writeln!(f, "Cluster '{name}' created; the load balancer has exited.")?
            }
            _ => writeln!(f, "Cluster '{}' created successfully!", self.cluster.name)?,
        }
        writeln!(f)?;
        writeln!(f, "Kubeconfig:    {}", self.cluster.kubeconfig_path.display())?;
        if let Some(balancer) = &self.balancer {
            if let (Some(pid), Some(log)) = (balancer.pid, &balancer.log_file_path) {
                writeln!(f, "Load balancer: pid {pid}, logs at {}", log.display())?;
            }
        }
        if let Some(ip) = self.service.as_ref().and_then(|s| s.first_external_ip()) {
            writeln!(f, "Address:       {ip}")?;
        }
        if !self.urls.is_empty() {
            writeln!(f)?;
            writeln!(f, "Access your cluster services at:")?;
            for url in &self.urls {
                writeln!(f, "  {url}")?;
            }
        }
        match &self.outcome {
            Outcome::Degraded { warning } => {
                writeln!(f)?;
                writeln!(f, "Warning: {warning}")?;
                writeln!(f, "Reload dnsmasq manually for the hostnames to resolve.")?;
            }
            Outcome::DnsSkipped => {
                writeln!(f)?;
                writeln!(f, "DNS sync skipped; hostnames above will not resolve locally.")?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// `http://<host>.<domain>` for every host that forms a valid URL.
pub fn service_urls(hosts: &[String], domain: &str) -> Vec<Url> {
    hosts
        .iter()
        .filter_map(|host| {
            let raw = format!("http://{host}.{domain}");
            Url::parse(&raw)
                .inspect_err(|e| warn!("skipping service URL {raw}: {e}"))
                .ok()
        })
        .collect()
}

/// Drives one cluster bootstrap from creation to a resolvable address.
/// Completed steps are never rolled back.
pub struct Bootstrap<'a> {
    provisioner: &'a dyn Provisioner,
    balancer: &'a dyn BalancerLauncher,
    connector: &'a dyn Connector,
    dns: &'a dyn DomainSync,
    options: BootstrapOptions,
    phase: Phase,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        provisioner: &'a dyn Provisioner,
        balancer: &'a dyn BalancerLauncher,
        connector: &'a dyn Connector,
        dns: &'a dyn DomainSync,
        options: BootstrapOptions,
    ) -> Self {
        Self {
            provisioner,
            balancer,
            connector,
            dns,
            options,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[tracing::instrument(skip_all, fields(cluster = %self.options.cluster_name))]
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Report, BootstrapError> {
        let result = self.converge(cancel).await;
        if let Err(e) = &result {
            error!(phase = %e.phase, "{}", e.source);
            if e.phase != Phase::Idle && e.phase != Phase::ClusterCreating {
                warn!(
                    "cluster '{}' was left running; manual cleanup may be required",
                    self.options.cluster_name
                );
            }
            self.phase = Phase::Failed;
        }
        result
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = %self.phase, to = %phase, "bootstrap phase");
        self.phase = phase;
    }

    fn failed(&self, source: AppError) -> BootstrapError {
        BootstrapError {
            phase: self.phase,
            source,
        }
    }

    async fn converge(&mut self, cancel: &CancellationToken) -> Result<Report, BootstrapError> {
        let options = self.options.clone();

        self.provisioner
            .preflight()
            .await
            .map_err(|e| self.failed(e))?;
        if options.start_balancer {
            self.balancer
                .ensure_installed()
                .await
                .map_err(|e| self.failed(e))?;
        }

        self.enter(Phase::ClusterCreating);
        let cluster = self
            .provisioner
            .create(
                &options.cluster_name,
                options.kind_config.as_deref(),
                &options.kubeconfig_path,
            )
            .await
            .map_err(|e| self.failed(e))?;

        let mut balancer = None;
        if options.start_balancer {
            self.enter(Phase::BalancerStarting);
            let process = self
                .balancer
                .start(&cluster.name, !options.balancer_foreground)
                .await
                .map_err(|e| self.failed(e))?;
            if options.balancer_foreground {
                info!("load balancer run completed");
                self.enter(Phase::Ready);
                return Ok(Report::new(cluster, None, Outcome::BalancerExited));
            }
            balancer = Some(process);
        } else {
            info!("not starting a load balancer; expecting one to be running already");
        }

        self.enter(Phase::AwaitingAddress);
        let query = self
            .connector
            .connect(&cluster)
            .await
            .map_err(|e| self.failed(e))?;
        let service = wait_for_load_balancer_address(
            query.as_ref(),
            &options.namespace,
            options.timeout,
            options.poll_interval,
            cancel,
        )
        .await
        .map_err(|e| self.failed(e))?;
        let ip = service.first_external_ip().unwrap_or_default().to_string();

        let mut report = Report::new(cluster, balancer, Outcome::Ready);
        report.urls = service_urls(&options.hosts, &options.domain);
        report.service = Some(service);

        if options.skip_dns {
            report.outcome = Outcome::DnsSkipped;
            self.enter(Phase::Ready);
            return Ok(report);
        }

        self.enter(Phase::SyncingDns);
        match self.dns.ensure_domain_ip(&options.domain, &ip).await {
            Ok(path) => report.dns_config = Some(path),
            Err(AppError::ReloadUnavailable { path, reason }) => {
                warn!(path = %path.display(), "dnsmasq config updated but not reloaded: {reason}");
                let warning = AppError::ReloadUnavailable {
                    path: path.clone(),
                    reason,
                }
                .to_string();
                report.dns_config = Some(path);
                report.outcome = Outcome::Degraded { warning };
            }
            Err(e) => return Err(self.failed(e)),
        }

        self.enter(Phase::Ready);
        Ok(report)
    }
}
