//! In-memory engine for tests.

use super::{
    all_running, OrchestrationEngine, RunPackageRequest, RunPackageResult, ServiceInfo,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A call received by [`MockEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    RunPackage { enclave: String, dry_run: bool },
    GetServices(String),
    WaitForServices(String),
    StopEnclave(String),
    DestroyEnclave(String),
}

#[derive(Debug, Default)]
struct MockEnclave {
    services: HashMap<String, ServiceInfo>,
    stopped: bool,
}

#[derive(Debug, Default)]
struct MockState {
    enclaves: HashMap<String, MockEnclave>,
    calls: Vec<EngineCall>,
}

/// Engine that serves a canned service map and records every call
///
/// Enclaves created through `run_package` receive a copy of the configured
/// services, except in dry-run mode where no containers are started.
#[derive(Debug, Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    services: HashMap<String, ServiceInfo>,
    fail_run: Option<String>,
    fail_get_services: Option<String>,
    fail_wait: bool,
    fail_destroy: Option<String>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Services started in every enclave this engine launches
    pub fn with_services(mut self, services: impl IntoIterator<Item = ServiceInfo>) -> Self {
        self.services = services
            .into_iter()
            .map(|service| (service.name.clone(), service))
            .collect();
        self
    }

    /// Pre-populate an enclave, as if launched by an earlier process
    pub fn with_enclave(
        self,
        enclave_name: impl Into<String>,
        services: impl IntoIterator<Item = ServiceInfo>,
    ) -> Self {
        self.lock().enclaves.insert(
            enclave_name.into(),
            MockEnclave {
                services: services
                    .into_iter()
                    .map(|service| (service.name.clone(), service))
                    .collect(),
                stopped: false,
            },
        );
        self
    }

    pub fn fail_run_package(mut self, message: impl Into<String>) -> Self {
        self.fail_run = Some(message.into());
        self
    }

    pub fn fail_get_services(mut self, message: impl Into<String>) -> Self {
        self.fail_get_services = Some(message.into());
        self
    }

    /// Make `wait_for_services` report a timeout
    pub fn fail_wait_for_services(mut self) -> Self {
        self.fail_wait = true;
        self
    }

    pub fn fail_destroy(mut self, message: impl Into<String>) -> Self {
        self.fail_destroy = Some(message.into());
        self
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, matches: impl Fn(&EngineCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn has_enclave(&self, enclave_name: &str) -> bool {
        self.lock().enclaves.contains_key(enclave_name)
    }

    pub fn is_stopped(&self, enclave_name: &str) -> bool {
        self.lock()
            .enclaves
            .get(enclave_name)
            .map(|enclave| enclave.stopped)
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: EngineCall) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl OrchestrationEngine for MockEngine {
    async fn run_package(
        &self,
        cancel: &CancellationToken,
        request: &RunPackageRequest,
    ) -> Result<RunPackageResult> {
        self.record(EngineCall::RunPackage {
            enclave: request.enclave_name.clone(),
            dry_run: request.dry_run,
        });
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(message) = &self.fail_run {
            return Err(Error::Engine(message.clone()));
        }

        let services = if request.dry_run {
            HashMap::new()
        } else {
            self.services.clone()
        };
        self.lock()
            .enclaves
            .entry(request.enclave_name.clone())
            .or_insert_with(|| MockEnclave {
                services,
                stopped: false,
            });

        Ok(RunPackageResult {
            enclave_name: request.enclave_name.clone(),
            response_lines: vec![format!("Starlark code successfully run: {}", request.package_id)],
        })
    }

    async fn get_services(
        &self,
        cancel: &CancellationToken,
        enclave_name: &str,
    ) -> Result<HashMap<String, ServiceInfo>> {
        self.record(EngineCall::GetServices(enclave_name.to_string()));
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(message) = &self.fail_get_services {
            return Err(Error::Engine(message.clone()));
        }

        self.lock()
            .enclaves
            .get(enclave_name)
            .map(|enclave| enclave.services.clone())
            .ok_or_else(|| Error::Engine(format!("enclave {enclave_name} not found")))
    }

    async fn wait_for_services(
        &self,
        cancel: &CancellationToken,
        enclave_name: &str,
        service_names: &[String],
        timeout: Duration,
    ) -> Result<()> {
        self.record(EngineCall::WaitForServices(enclave_name.to_string()));
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let ready = !self.fail_wait
            && self
                .lock()
                .enclaves
                .get(enclave_name)
                .map(|enclave| all_running(&enclave.services, service_names))
                .unwrap_or(false);

        if ready {
            Ok(())
        } else {
            Err(Error::WaitTimeout {
                resource: format!("services in enclave {enclave_name}"),
                timeout,
            })
        }
    }

    async fn stop_enclave(&self, _cancel: &CancellationToken, enclave_name: &str) -> Result<()> {
        self.record(EngineCall::StopEnclave(enclave_name.to_string()));
        let mut state = self.lock();
        let enclave = state
            .enclaves
            .get_mut(enclave_name)
            .ok_or_else(|| Error::Engine(format!("enclave {enclave_name} not found")))?;
        enclave.stopped = true;
        for service in enclave.services.values_mut() {
            service.status = "STOPPED".to_string();
        }
        Ok(())
    }

    async fn destroy_enclave(&self, _cancel: &CancellationToken, enclave_name: &str) -> Result<()> {
        self.record(EngineCall::DestroyEnclave(enclave_name.to_string()));
        if let Some(message) = &self.fail_destroy {
            return Err(Error::Engine(message.clone()));
        }
        self.lock().enclaves.remove(enclave_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(enclave: &str, dry_run: bool) -> RunPackageRequest {
        RunPackageRequest {
            package_id: "github.com/ethpandaops/ethereum-package".into(),
            enclave_name: enclave.into(),
            config_yaml: "participants: []\n".into(),
            dry_run,
            parallelism: 4,
            verbose: false,
        }
    }

    #[tokio::test]
    async fn test_enclave_registry_lifecycle() {
        let engine =
            MockEngine::new().with_services([ServiceInfo::new("el-1-geth-lighthouse", "10.0.0.1")]);
        let cancel = CancellationToken::new();

        engine.run_package(&cancel, &request("devnet", false)).await.unwrap();
        assert!(engine.has_enclave("devnet"));
        assert_eq!(engine.get_services(&cancel, "devnet").await.unwrap().len(), 1);
        engine
            .wait_for_services(&cancel, "devnet", &[], Duration::from_secs(1))
            .await
            .unwrap();

        engine.stop_enclave(&cancel, "devnet").await.unwrap();
        assert!(engine.is_stopped("devnet"));

        engine.destroy_enclave(&cancel, "devnet").await.unwrap();
        assert!(!engine.has_enclave("devnet"));
        assert!(engine.get_services(&cancel, "devnet").await.is_err());
        assert_eq!(engine.calls().len(), 6);
    }

    #[tokio::test]
    async fn test_dry_run_starts_nothing() {
        let engine =
            MockEngine::new().with_services([ServiceInfo::new("el-1-geth-lighthouse", "10.0.0.1")]);
        let cancel = CancellationToken::new();

        engine.run_package(&cancel, &request("dry", true)).await.unwrap();
        assert!(engine.get_services(&cancel, "dry").await.unwrap().is_empty());
    }
}
