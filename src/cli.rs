use std::{io::Write, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    balancer::Supervisor,
    config::Settings,
    discovery::KubeConnector,
    dnsmasq::Synchronizer,
    error::AppError,
    host::SystemHost,
    kind::{Kind, kubeconfig_path, resolve_kind_config},
    runner::{Bootstrap, BootstrapOptions},
};

/// Bootstrap a local kind cluster with a load balancer and local DNS.
#[derive(Parser, Debug)]
#[command(name = "k8s-local-bench", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Working directory with kind configs and generated kubeconfigs
    #[arg(short = 'd', long, global = true, env = "K8S_LOCAL_BENCH_DIRECTORY")]
    pub directory: Option<PathBuf>,

    /// Config file (default: ~/.k8s-local-bench.yaml)
    #[arg(short = 'c', long, global = true, env = "K8S_LOCAL_BENCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true, env = "K8S_LOCAL_BENCH_DEBUG")]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or destroy the local cluster
    #[command(subcommand)]
    Cluster(ClusterCommand),
    /// Run the cloud-provider-kind load balancer
    #[command(subcommand)]
    Lb(LbCommand),
    /// Manage the local dnsmasq mapping
    #[command(subcommand)]
    Dns(DnsCommand),
}

#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// Create a kind cluster, start the load balancer and point DNS at it
    Create(CreateArgs),
    /// Delete the kind cluster
    Destroy(DestroyArgs),
}

#[derive(Subcommand, Debug)]
pub enum LbCommand {
    /// Start cloud-provider-kind for a cluster
    Start(LbStartArgs),
}

#[derive(Subcommand, Debug)]
pub enum DnsCommand {
    /// Map a domain to an address in dnsmasq and reload it
    Sync(DnsSyncArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(long, env = "K8S_LOCAL_BENCH_CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// kind config file (default: discovered in the working directory)
    #[arg(short = 'k', long)]
    pub kind_config: Option<PathBuf>,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Start cloud-provider-kind after the cluster is created
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub start_lb: bool,

    /// Run the load balancer in the foreground; the command ends when it exits
    #[arg(long)]
    pub lb_foreground: bool,

    /// Base domain mapped to the load balancer address
    #[arg(long, env = "K8S_LOCAL_BENCH_DOMAIN")]
    pub domain: Option<String>,

    /// Namespace of the ingress LoadBalancer service
    #[arg(long, env = "K8S_LOCAL_BENCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Seconds to wait for a load balancer address
    #[arg(long, env = "K8S_LOCAL_BENCH_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Seconds between service queries
    #[arg(long, env = "K8S_LOCAL_BENCH_POLL_INTERVAL")]
    pub poll_interval: Option<u64>,

    #[arg(long, env = "K8S_LOCAL_BENCH_DNSMASQ_CONFIG")]
    pub dnsmasq_config: Option<PathBuf>,

    /// Leave the resolver config untouched
    #[arg(long)]
    pub skip_dns: bool,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DestroyArgs {
    #[arg(long, env = "K8S_LOCAL_BENCH_CLUSTER_NAME")]
    pub cluster_name: Option<String>,
}

#[derive(Args, Debug)]
pub struct LbStartArgs {
    #[arg(long, env = "K8S_LOCAL_BENCH_CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// Block until the load balancer exits
    #[arg(long)]
    pub foreground: bool,
}

#[derive(Args, Debug)]
pub struct DnsSyncArgs {
    #[arg(long, env = "K8S_LOCAL_BENCH_DOMAIN")]
    pub domain: Option<String>,

    /// Address the domain should resolve to
    #[arg(long)]
    pub ip: String,

    #[arg(long, env = "K8S_LOCAL_BENCH_DNSMASQ_CONFIG")]
    pub dnsmasq_config: Option<PathBuf>,
}

impl Cli {
    /// Settings from the config file with the global flags applied.
    pub fn settings(&self) -> Result<Settings, AppError> {
        let mut settings = Settings::load(self.global.config.as_deref())?;
        if let Some(directory) = &self.global.directory {
            settings.directory = directory.clone();
        }
        settings.debug |= self.global.debug;
        Ok(settings)
    }

    pub async fn run(self, settings: Settings) -> anyhow::Result<()> {
        match self.command {
            Commands::Cluster(ClusterCommand::Create(args)) => {
                create_cluster(args, settings).await
            }
            Commands::Cluster(ClusterCommand::Destroy(args)) => {
                destroy_cluster(args, settings).await
            }
            Commands::Lb(LbCommand::Start(args)) => start_balancer(args, settings).await,
            Commands::Dns(DnsCommand::Sync(args)) => sync_dns(args, settings).await,
        }
    }
}

impl CreateArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(name) = &self.cluster_name {
            settings.cluster_name = name.clone();
        }
        if let Some(domain) = &self.domain {
            settings.domain = domain.clone();
        }
        if let Some(namespace) = &self.namespace {
            settings.namespace = namespace.clone();
        }
        if let Some(secs) = self.timeout {
            settings.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.poll_interval {
            settings.poll_interval = Duration::from_secs(secs);
        }
        if self.dnsmasq_config.is_some() {
            settings.dnsmasq_config = self.dnsmasq_config.clone();
        }
    }
}

async fn create_cluster(args: CreateArgs, mut settings: Settings) -> anyhow::Result<()> {
    args.apply(&mut settings);

    let kind_config = resolve_kind_config(args.kind_config.as_deref(), &settings.directory);
    let kubeconfig = kubeconfig_path(&settings.directory, &settings.cluster_name);

    println!("Cluster name: {}", settings.cluster_name);
    println!("Directory:    {}", settings.directory.display());
    println!("Kubeconfig:   {}", kubeconfig.display());
    match &kind_config {
        Some(path) => println!("Kind config:  {}", path.display()),
        None => println!("Kind config:  (none)"),
    }
    println!("Domain:       {}", settings.domain);

    if !args.yes && !confirm("Proceed to create cluster?").await? {
        println!("Aborted.");
        return Ok(());
    }

    let host = SystemHost;
    let provisioner = Kind::new(&host);
    let supervisor = Supervisor::new(&host, settings.balancer_config());
    let dns = Synchronizer::new(&host, settings.dnsmasq_config.clone());

    let options = BootstrapOptions {
        cluster_name: settings.cluster_name.clone(),
        kind_config,
        kubeconfig_path: kubeconfig,
        start_balancer: args.start_lb,
        balancer_foreground: args.lb_foreground,
        namespace: settings.namespace.clone(),
        domain: settings.domain.clone(),
        hosts: settings.hosts.clone(),
        timeout: settings.timeout,
        poll_interval: settings.poll_interval,
        skip_dns: args.skip_dns,
    };

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                cancel.cancel();
            }
        })
    };

    let mut bootstrap = Bootstrap::new(&provisioner, &supervisor, &KubeConnector, &dns, options);
    let result = bootstrap.run(&cancel).await;
    interrupt.abort();
    debug!(phase = %bootstrap.phase(), "bootstrap finished");
    let report = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

async fn destroy_cluster(args: DestroyArgs, settings: Settings) -> anyhow::Result<()> {
    let name = args.cluster_name.unwrap_or(settings.cluster_name);
    let host = SystemHost;
    Kind::new(&host)
        .delete(&name)
        .await
        .with_context(|| format!("failed to delete cluster {name}"))?;
    println!("Cluster '{name}' deleted.");
    Ok(())
}

async fn start_balancer(args: LbStartArgs, settings: Settings) -> anyhow::Result<()> {
    let name = args.cluster_name.unwrap_or_else(|| settings.cluster_name.clone());
    let host = SystemHost;
    let supervisor = Supervisor::new(&host, settings.balancer_config());

    supervisor.ensure_installed().await?;
    let process = supervisor.start(&name, !args.foreground).await?;

    if let (Some(pid), Some(log)) = (process.pid, &process.log_file_path) {
        println!("Load balancer started (pid {pid}), logs at {}", log.display());
    }
    Ok(())
}

async fn sync_dns(args: DnsSyncArgs, settings: Settings) -> anyhow::Result<()> {
    let domain = args.domain.unwrap_or(settings.domain);
    let host = SystemHost;
    let sync = Synchronizer::new(&host, args.dnsmasq_config.or(settings.dnsmasq_config));

    match sync.ensure_domain_ip(&domain, &args.ip).await {
        Ok(path) => {
            info!(path = %path.display(), "dnsmasq updated");
            println!("{domain} -> {} ({})", args.ip, path.display());
            Ok(())
        }
        Err(e) if e.is_non_fatal() => {
            warn!("{e}");
            println!("Warning: {e}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn confirm(prompt: &str) -> Result<bool, AppError> {
    print!("{prompt} [y/N]: ");
    std::io::stdout()
        .flush()
        .map_err(|e| AppError::io("failed to write", "stdout", e))?;

    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .map_err(|e| AppError::io("failed to read", "stdin", e))?;
    Ok(is_affirmative(&answer))
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
