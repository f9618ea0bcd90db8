use std::{path::Path, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::{
    Api, Client, Config,
    api::ListParams,
    config::{KubeConfigOptions, Kubeconfig},
};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, TimeoutCause},
    invalid_arg,
    model::{ClusterHandle, ServicePort, ServiceRecord, ServiceType},
    runner::Connector,
};

/// Source of Service snapshots for a namespace.
#[async_trait]
pub trait ServiceQuery: Send + Sync {
    /// Lists Services in `namespace`, keeping only `service_type` when given.
    async fn list_services(
        &self,
        namespace: &str,
        service_type: Option<ServiceType>,
    ) -> Result<Vec<ServiceRecord>, AppError>;
}

/// Queries the cluster API using the credentials of a kubeconfig file.
pub struct KubeServiceQuery {
    client: Client,
}

impl KubeServiceQuery {
    pub async fn from_kubeconfig(path: &Path) -> Result<Self, AppError> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            AppError::unavailable(
                format!("kubeconfig {}", path.display()),
                format!("failed to read kubeconfig: {e}"),
            )
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                AppError::unavailable(
                    format!("kubeconfig {}", path.display()),
                    format!("failed to load kubeconfig: {e}"),
                )
            })?;
        let client = Client::try_from(config)?;
        info!(kubeconfig = %path.display(), "Connected to Kubernetes API");
        Ok(Self { client })
    }
}

#[async_trait]
impl ServiceQuery for KubeServiceQuery {
    async fn list_services(
        &self,
        namespace: &str,
        service_type: Option<ServiceType>,
    ) -> Result<Vec<ServiceRecord>, AppError> {
        if namespace.is_empty() {
            return invalid_arg!("namespace must be provided");
        }

        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = services.list(&ListParams::default()).await?;

        let records = list
            .items
            .iter()
            .filter_map(to_service_record)
            .filter(|svc| service_type.is_none_or(|t| svc.service_type == t))
            .collect();
        Ok(records)
    }
}

/// Connects to a freshly created cluster through its kubeconfig.
pub struct KubeConnector;

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, cluster: &ClusterHandle) -> Result<Box<dyn ServiceQuery>, AppError> {
        let query = KubeServiceQuery::from_kubeconfig(&cluster.kubeconfig_path).await?;
        Ok(Box::new(query))
    }
}

fn to_service_record(svc: &Service) -> Option<ServiceRecord> {
    let name = svc.metadata.name.clone().unwrap_or_default();
    let spec = svc.spec.as_ref();

    let service_type = match spec.and_then(|s| s.type_.as_deref()) {
        None => ServiceType::ClusterIP,
        Some(t) => match t.parse() {
            Ok(t) => t,
            Err(e) => {
                debug!(service = %name, "skipping service: {e}");
                return None;
            }
        },
    };

    let mut external_ips = spec
        .and_then(|s| s.external_ips.clone())
        .unwrap_or_default();
    let ingress = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref());
    if let Some(ingress) = ingress {
        external_ips.extend(
            ingress
                .iter()
                .filter_map(|i| i.ip.clone())
                .filter(|ip| !ip.is_empty()),
        );
    }

    let ports = spec
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| ServicePort {
                    name: p.name.clone().unwrap_or_default(),
                    port: p.port,
                    protocol: p.protocol.clone().unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ServiceRecord {
        name,
        namespace: svc.metadata.namespace.clone().unwrap_or_default(),
        service_type,
        cluster_ip: spec.and_then(|s| s.cluster_ip.clone()).unwrap_or_default(),
        external_ips,
        ports,
    })
}

/// Polls `namespace` until exactly one LoadBalancer Service has an external
/// address. The first query happens one `poll_interval` after the call.
/// Query errors are retried until the deadline.
pub async fn wait_for_load_balancer_address(
    query: &dyn ServiceQuery,
    namespace: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<ServiceRecord, AppError> {
    if namespace.is_empty() {
        return invalid_arg!("namespace must be provided");
    }
    if poll_interval.is_zero() {
        return invalid_arg!("poll interval must be positive");
    }

    let start = Instant::now();
    let deadline = start + timeout;
    let mut ticker = interval_at(start + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let timed_out = |cause| AppError::Timeout {
        what: format!("LoadBalancer service in namespace {namespace}"),
        elapsed: start.elapsed(),
        cause,
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(timed_out(TimeoutCause::Cancelled)),
            _ = sleep_until(deadline) => return Err(timed_out(TimeoutCause::Deadline)),
            _ = ticker.tick() => {}
        }

        // an in-flight query is bounded by the same deadline and token
        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(timed_out(TimeoutCause::Cancelled)),
            _ = sleep_until(deadline) => return Err(timed_out(TimeoutCause::Deadline)),
            listed = query.list_services(namespace, Some(ServiceType::LoadBalancer)) => listed,
        };
        let services = match listed {
            Ok(services) => services,
            Err(e) => {
                debug!(namespace, "service query failed, retrying: {e}");
                continue;
            }
        };

        match services.as_slice() {
            [svc] if !svc.external_ips.is_empty() => {
                info!(
                    namespace,
                    service = %svc.name,
                    ip = %svc.external_ips[0],
                    "LoadBalancer service has an external address"
                );
                return Ok(svc.clone());
            }
            [svc] => debug!(namespace, service = %svc.name, "waiting for an external address"),
            [] => debug!(namespace, "no LoadBalancer service yet"),
            many => {
                let names: Vec<&str> = many.iter().map(|s| s.name.as_str()).collect();
                warn!(
                    namespace,
                    services = ?names,
                    "more than one LoadBalancer service; waiting for exactly one"
                );
            }
        }
    }
}
