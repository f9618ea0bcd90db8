use std::{fmt, path::PathBuf, str::FromStr};

use serde::Serialize;

/// A provisioned cluster. Not persisted; callers pass it along explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterHandle {
    pub name: String,
    #[serde(rename = "kubeconfigPath")]
    pub kubeconfig_path: PathBuf,
}

/// A balancer process as launched by the supervisor. Once returned, nothing
/// tracks it further.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalancerProcess {
    pub pid: Option<u32>,
    #[serde(rename = "logFilePath")]
    pub log_file_path: Option<PathBuf>,
    pub detached: bool,
    pub privileged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceType {
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clusterip" => Ok(ServiceType::ClusterIP),
            "nodeport" => Ok(ServiceType::NodePort),
            "loadbalancer" => Ok(ServiceType::LoadBalancer),
            "externalname" => Ok(ServiceType::ExternalName),
            _ => Err(format!("unknown service type: {s}")),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::ExternalName => "ExternalName",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
    pub protocol: String,
}

/// Snapshot of a Service taken by a single poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(rename = "clusterIP")]
    pub cluster_ip: String,
    /// `spec.externalIPs` followed by `status.loadBalancer.ingress[].ip`.
    #[serde(rename = "externalIPs")]
    pub external_ips: Vec<String>,
    pub ports: Vec<ServicePort>,
}

impl ServiceRecord {
    pub fn first_external_ip(&self) -> Option<&str> {
        self.external_ips.first().map(String::as_str)
    }
}

/// One `address=/<domain>/<ip>` line of resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMapping {
    pub domain: String,
    pub ip: String,
}

impl DomainMapping {
    pub fn new(domain: &str, ip: &str) -> Result<Self, String> {
        if domain.is_empty() {
            return Err("domain must be provided".to_string());
        }
        if ip.is_empty() {
            return Err("ip must be provided".to_string());
        }
        Ok(Self {
            domain: domain.to_string(),
            ip: ip.to_string(),
        })
    }

    /// Prefix identifying any active line for this domain.
    pub fn prefix(&self) -> String {
        format!("address=/{}/", self.domain)
    }

    pub fn line(&self) -> String {
        format!("{}{}", self.prefix(), self.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_parses_case_insensitively() {
        assert_eq!(
            "loadbalancer".parse::<ServiceType>(),
            Ok(ServiceType::LoadBalancer)
        );
        assert_eq!("NodePort".parse::<ServiceType>(), Ok(ServiceType::NodePort));
        assert!("Headless".parse::<ServiceType>().is_err());
    }

    #[test]
    fn domain_mapping_line() {
        let mapping = DomainMapping::new("k8s-bench.local", "172.18.0.5").unwrap();
        assert_eq!(mapping.prefix(), "address=/k8s-bench.local/");
        assert_eq!(mapping.line(), "address=/k8s-bench.local/172.18.0.5");
    }

    #[test]
    fn domain_mapping_rejects_empty_fields() {
        assert!(DomainMapping::new("", "1.1.1.1").is_err());
        assert!(DomainMapping::new("a.local", "").is_err());
    }
}
