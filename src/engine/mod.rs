//! Orchestration engine abstraction.
//!
//! The engine owns the containers: it runs a package inside an enclave, reports
//! the services it started, and tears enclaves down. [`KurtosisCli`] drives the
//! real `kurtosis` binary; [`MockEngine`] serves canned service maps for tests.

mod kurtosis;
mod mock;

pub use kurtosis::{parse_enclave_inspect, KurtosisCli};
pub use mock::{EngineCall, MockEngine};

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Status string the engine reports for a healthy container
pub const STATUS_RUNNING: &str = "RUNNING";

/// Everything needed to run a package inside an enclave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPackageRequest {
    pub package_id: String,
    pub enclave_name: String,
    /// Package arguments as a YAML document
    pub config_yaml: String,
    pub dry_run: bool,
    pub parallelism: u32,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunPackageResult {
    pub enclave_name: String,
    pub response_lines: Vec<String>,
}

/// A port as reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub number: u16,
    pub protocol: String,
    /// Host-reachable address, e.g. `http://127.0.0.1:32769`, when published
    pub url: Option<String>,
}

impl PortInfo {
    pub fn new(number: u16) -> Self {
        Self {
            number,
            protocol: "tcp".to_string(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// A service as reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub uuid: String,
    pub status: String,
    pub ip_address: String,
    pub hostname: String,
    pub ports: HashMap<String, PortInfo>,
}

impl ServiceInfo {
    /// A running service at `ip_address` with no ports
    pub fn new(name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: STATUS_RUNNING.to_string(),
            ip_address: ip_address.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, name: impl Into<String>, port: PortInfo) -> Self {
        self.ports.insert(name.into(), port);
        self
    }

    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_RUNNING)
    }
}

/// Operations the devnet launcher needs from an orchestration engine
#[async_trait]
pub trait OrchestrationEngine: Send + Sync {
    /// Run `request.package_id` with its arguments inside `request.enclave_name`
    async fn run_package(
        &self,
        cancel: &CancellationToken,
        request: &RunPackageRequest,
    ) -> Result<RunPackageResult>;

    /// List every service in the enclave keyed by service name
    async fn get_services(
        &self,
        cancel: &CancellationToken,
        enclave_name: &str,
    ) -> Result<HashMap<String, ServiceInfo>>;

    /// Block until the named services (all services when empty) are running
    async fn wait_for_services(
        &self,
        cancel: &CancellationToken,
        enclave_name: &str,
        service_names: &[String],
        timeout: Duration,
    ) -> Result<()>;

    async fn stop_enclave(&self, cancel: &CancellationToken, enclave_name: &str) -> Result<()>;

    async fn destroy_enclave(&self, cancel: &CancellationToken, enclave_name: &str)
        -> Result<()>;
}

/// Whether the named services (every service when `names` is empty) are running
pub(crate) fn all_running(services: &HashMap<String, ServiceInfo>, names: &[String]) -> bool {
    if names.is_empty() {
        return !services.is_empty() && services.values().all(ServiceInfo::is_running);
    }
    names.iter().all(|name| {
        services
            .get(name)
            .map(ServiceInfo::is_running)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_running() {
        let mut services = HashMap::new();
        assert!(!all_running(&services, &[]));

        services.insert("el-1".to_string(), ServiceInfo::new("el-1", "10.0.0.1"));
        let mut stopped = ServiceInfo::new("vc-1", "10.0.0.3");
        stopped.status = "STOPPED".to_string();
        services.insert("vc-1".to_string(), stopped);

        assert!(!all_running(&services, &[]));
        assert!(all_running(&services, &["el-1".to_string()]));
        assert!(!all_running(&services, &["cl-1".to_string()]));
    }
}
