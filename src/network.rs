use crate::{
    client::{Client, ClientCollection, ConsensusClient, ExecutionClient},
    lifecycle::{CleanupGate, CleanupRegistry, Teardown},
    service::{ConfigServer, Service},
    wait::{WaitStrategy, WaitTarget},
    Result,
};
use std::sync::Arc;
use tokio::runtime::RuntimeFlavor;
use tokio_util::sync::CancellationToken;

/// Everything the mapper discovered, before lifecycle wiring
pub(crate) struct NetworkParts {
    pub name: String,
    pub chain_id: u64,
    pub enclave_name: String,
    pub execution_clients: ClientCollection<ExecutionClient>,
    pub consensus_clients: ClientCollection<ConsensusClient>,
    pub services: Vec<Service>,
    pub config_server: Option<ConfigServer>,
    pub prometheus_url: Option<String>,
    pub grafana_url: Option<String>,
    pub explorer_url: Option<String>,
}

/// A running devnet inside one enclave
///
/// Unless the network was orphaned, the enclave is destroyed on SIGINT/SIGTERM
/// and when the value is dropped without an explicit [`Network::cleanup`].
#[derive(Debug)]
pub struct Network {
    name: String,
    chain_id: u64,
    enclave_name: String,
    execution_clients: ClientCollection<ExecutionClient>,
    consensus_clients: ClientCollection<ConsensusClient>,
    services: Vec<Service>,
    config_server: Option<ConfigServer>,
    prometheus_url: Option<String>,
    grafana_url: Option<String>,
    explorer_url: Option<String>,
    gate: Arc<CleanupGate>,
    auto_cleanup: bool,
    registration: Option<u64>,
}

impl Network {
    /// Create a new network builder
    pub fn builder() -> crate::builder::NetworkBuilder {
        crate::builder::NetworkBuilder::new()
    }

    pub(crate) fn new(parts: NetworkParts, teardown: Option<Teardown>, auto_cleanup: bool) -> Self {
        let gate = Arc::new(teardown.map(CleanupGate::new).unwrap_or_else(CleanupGate::noop));

        let registration = if auto_cleanup {
            let registry = CleanupRegistry::global();
            let id = registry.register(&gate);
            if registry.install_signal_handler_once() {
                tracing::debug!("Installed devnet cleanup signal handler");
            }
            Some(id)
        } else {
            None
        };

        Self {
            name: parts.name,
            chain_id: parts.chain_id,
            enclave_name: parts.enclave_name,
            execution_clients: parts.execution_clients,
            consensus_clients: parts.consensus_clients,
            services: parts.services,
            config_server: parts.config_server,
            prometheus_url: parts.prometheus_url,
            grafana_url: parts.grafana_url,
            explorer_url: parts.explorer_url,
            gate,
            auto_cleanup,
            registration,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn enclave_name(&self) -> &str {
        &self.enclave_name
    }

    pub fn execution_clients(&self) -> &ClientCollection<ExecutionClient> {
        &self.execution_clients
    }

    pub fn consensus_clients(&self) -> &ClientCollection<ConsensusClient> {
        &self.consensus_clients
    }

    /// Every service in the enclave, clients included
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn config_server(&self) -> Option<&ConfigServer> {
        self.config_server.as_ref()
    }

    pub fn prometheus_url(&self) -> Option<&str> {
        self.prometheus_url.as_deref()
    }

    pub fn grafana_url(&self) -> Option<&str> {
        self.grafana_url.as_deref()
    }

    pub fn explorer_url(&self) -> Option<&str> {
        self.explorer_url.as_deref()
    }

    /// Whether the enclave is torn down when the process is interrupted or
    /// this value is dropped
    pub fn auto_cleanup(&self) -> bool {
        self.auto_cleanup
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.gate.is_done()
    }

    /// Let the enclave outlive this value and the process
    pub fn disarm_auto_cleanup(&mut self) {
        if let Some(id) = self.registration.take() {
            CleanupRegistry::global().unregister(id);
        }
        self.auto_cleanup = false;
    }

    /// Destroy the enclave.
    ///
    /// Only the first call tears down; later calls return the same result.
    pub async fn cleanup(&self) -> Result<()> {
        if !self.gate.is_done() {
            tracing::info!("Cleaning up network {} (enclave {})", self.name, self.enclave_name);
        }
        if let Some(id) = self.registration {
            CleanupRegistry::global().unregister(id);
        }
        self.gate.run().await
    }

    /// Pause the network without destroying it. Currently does nothing.
    pub async fn stop(&self, _cancel: &CancellationToken) -> Result<()> {
        tracing::debug!("Stop requested for enclave {}; nothing to do", self.enclave_name);
        Ok(())
    }

    /// Apply `execution` to every execution client and `consensus` to every
    /// consensus client, all concurrently.
    ///
    /// Every wait runs to completion; the first failure in client order is
    /// returned.
    pub async fn wait_for_clients(
        &self,
        cancel: &CancellationToken,
        execution: &dyn WaitStrategy,
        consensus: &dyn WaitStrategy,
    ) -> Result<()> {
        let mut targets: Vec<(&dyn WaitTarget, &dyn WaitStrategy)> = Vec::new();
        for client in sorted(self.execution_clients.all()) {
            targets.push((client as &dyn WaitTarget, execution));
        }
        for client in sorted(self.consensus_clients.all()) {
            targets.push((client as &dyn WaitTarget, consensus));
        }

        tracing::info!("Waiting for {} clients in {}", targets.len(), self.enclave_name);

        let results = futures::future::join_all(
            targets
                .iter()
                .map(|(target, strategy)| strategy.wait_until_ready(cancel, *target)),
        )
        .await;

        for ((target, _), result) in targets.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("{} not ready: {}", target.describe(), e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Export the discovered topology as pretty-printed JSON
    pub fn summary_json(&self) -> String {
        serde_json::to_string_pretty(&serde_json::json!({
            "name": self.name,
            "chain_id": self.chain_id,
            "enclave": self.enclave_name,
            "execution_clients": sorted(self.execution_clients.all()),
            "consensus_clients": sorted(self.consensus_clients.all()),
            "services": self.services,
            "config_server": self.config_server.as_ref().map(ConfigServer::url),
            "prometheus": self.prometheus_url,
            "grafana": self.grafana_url,
            "explorer": self.explorer_url,
        }))
        .unwrap_or_default()
    }
}

fn sorted<C: Client>(mut clients: Vec<&C>) -> Vec<&C> {
    clients.sort_by(|a, b| a.name().cmp(b.name()));
    clients
}

impl Drop for Network {
    fn drop(&mut self) {
        if let Some(id) = self.registration.take() {
            CleanupRegistry::global().unregister(id);
        }
        if !self.auto_cleanup || self.gate.is_done() {
            return;
        }

        tracing::info!(
            "Network {} dropped without cleanup, destroying enclave {}",
            self.name,
            self.enclave_name
        );
        let gate = Arc::clone(&self.gate);
        let cleanup = async move {
            if let Err(e) = gate.run().await {
                tracing::warn!("Cleanup on drop failed: {}", e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(cleanup));
            }
            // Current-thread runtimes cannot block in place and may shut down
            // before a spawned task is polled
            Ok(_) => {
                let joined = std::thread::Builder::new()
                    .name("devnet-drop-cleanup".into())
                    .spawn(move || block_on_fresh_runtime(cleanup))
                    .map(|thread| thread.join());
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => tracing::error!("Cleanup thread panicked"),
                    Err(e) => tracing::error!("Failed to spawn cleanup thread: {}", e),
                }
            }
            Err(_) => block_on_fresh_runtime(cleanup),
        }
    }
}

fn block_on_fresh_runtime(cleanup: impl std::future::Future<Output = ()>) {
    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(cleanup),
        Err(e) => tracing::error!("Failed to create runtime for cleanup: {}", e),
    }
}
