use crate::{
    binary::KurtosisBinary,
    client::Client,
    config::{ConfigSource, NetworkConfig, NetworkParams, Participant, ResolvedConfig},
    engine::{KurtosisCli, OrchestrationEngine, RunPackageRequest},
    lifecycle::Teardown,
    mapper::{map_services, MappingContext},
    network::Network,
    wait::{poll_until, WaitStrategy},
    Error, Result,
};
use chrono::Utc;
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Package launched when none is configured
pub const DEFAULT_PACKAGE_ID: &str = "github.com/ethpandaops/ethereum-package";

/// Environment variable overriding the package id
pub const PACKAGE_ENV: &str = "ETHEREUM_PACKAGE";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_PARALLELISM: u32 = 4;
const GENESIS_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_ENCLAVE_NAME_LEN: usize = 60;

/// Builder for configuring and launching a devnet
///
/// Launch order is fixed: submit the package, wait for every service to run,
/// map the services, then the optional client and genesis waits.
pub struct NetworkBuilder {
    name: Option<String>,
    enclave_name: String,
    package_id: String,
    config: ConfigSource,
    participants: Vec<Participant>,
    chain_id: Option<u64>,
    additional_services: Vec<String>,
    timeout: Duration,
    dry_run: bool,
    parallelism: u32,
    verbose: bool,
    orphan: bool,
    wait_for_genesis: bool,
    client_waits: Option<(Arc<dyn WaitStrategy>, Arc<dyn WaitStrategy>)>,
    binary: KurtosisBinary,
    engine: Option<Arc<dyn OrchestrationEngine>>,
    cancel: CancellationToken,
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkBuilder {
    pub fn new() -> Self {
        let package_id = std::env::var(PACKAGE_ENV)
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_PACKAGE_ID.to_string());

        Self {
            name: None,
            enclave_name: generate_enclave_name(),
            package_id,
            config: ConfigSource::Built(NetworkConfig::default()),
            participants: Vec::new(),
            chain_id: None,
            additional_services: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            dry_run: false,
            parallelism: DEFAULT_PARALLELISM,
            verbose: false,
            orphan: false,
            wait_for_genesis: false,
            client_waits: None,
            binary: KurtosisBinary::default(),
            engine: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Human-readable network name; defaults to the enclave name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Enclave to create; defaults to `devnet-<timestamp>-<random>`
    pub fn enclave_name(mut self, enclave_name: impl Into<String>) -> Self {
        self.enclave_name = enclave_name.into();
        self
    }

    pub fn package_id(mut self, package_id: impl Into<String>) -> Self {
        self.package_id = package_id.into();
        self
    }

    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = ConfigSource::Built(config);
        self
    }

    /// Pass package arguments as raw YAML
    pub fn config_yaml(mut self, yaml: impl Into<String>) -> Self {
        self.config = ConfigSource::Yaml(yaml.into());
        self
    }

    /// Read package arguments from a YAML file at build time
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = ConfigSource::File(path.into());
        self
    }

    pub fn config_source(mut self, source: ConfigSource) -> Self {
        self.config = source;
        self
    }

    /// Add a participant; the first call replaces the configured participants
    pub fn participant(mut self, participant: Participant) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    /// Enable an auxiliary package service such as `dora` or `prometheus_grafana`
    pub fn additional_service(mut self, service: impl Into<String>) -> Self {
        self.additional_services.push(service.into());
        self
    }

    /// Upper bound for services to start and for the genesis time lookup
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Submit the package without starting containers
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Keep the enclave after the network is dropped or the process exits
    pub fn orphan(mut self, orphan: bool) -> Self {
        self.orphan = orphan;
        self
    }

    /// Block until the chain's genesis time has passed
    pub fn wait_for_genesis(mut self, wait: bool) -> Self {
        self.wait_for_genesis = wait;
        self
    }

    /// Wait on every client after discovery, e.g. with
    /// [`default_execution_wait`](crate::wait::default_execution_wait) and
    /// [`default_consensus_wait`](crate::wait::default_consensus_wait)
    pub fn client_wait_strategies(
        mut self,
        execution: impl WaitStrategy + 'static,
        consensus: impl WaitStrategy + 'static,
    ) -> Self {
        self.client_waits = Some((Arc::new(execution), Arc::new(consensus)));
        self
    }

    /// Set which kurtosis binary drives the default engine
    pub fn binary(mut self, binary: KurtosisBinary) -> Self {
        self.binary = binary;
        self
    }

    /// Use `engine` instead of the kurtosis CLI
    pub fn engine(mut self, engine: Arc<dyn OrchestrationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Token that aborts every engine call and wait when cancelled
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build and start the network (async)
    pub async fn build(self) -> Result<Network> {
        let config = self.prepare()?;
        let engine = self.resolve_engine()?;
        self.launch(engine, config).await
    }

    /// Build the network synchronously (for use in LazyLock)
    pub fn build_sync(self) -> Result<Network> {
        tokio::runtime::Runtime::new()?.block_on(self.build())
    }

    /// Attach to the enclave `name` if it already has services, otherwise
    /// launch a new network in it.
    pub async fn find_or_create(self, name: impl Into<String>) -> Result<Network> {
        let builder = self.enclave_name(name);
        let config = builder.prepare()?;
        let engine = builder.resolve_engine()?;

        match engine
            .get_services(&builder.cancel, &builder.enclave_name)
            .await
        {
            Ok(services) if !services.is_empty() => {
                tracing::info!(
                    "Reusing {} services in enclave {}",
                    services.len(),
                    builder.enclave_name
                );
                let context = builder.mapping_context(&engine, config.chain_id);
                return map_services(&services, context).map_err(|e| Error::Discovery {
                    enclave: builder.enclave_name.clone(),
                    source: Box::new(e),
                });
            }
            Ok(_) => {
                tracing::debug!("Enclave {} has no services", builder.enclave_name);
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::debug!("Enclave {} not found: {}", builder.enclave_name, e);
            }
        }

        builder.launch(engine, config).await
    }

    /// Check options and resolve the package arguments without touching the engine
    fn prepare(&self) -> Result<ResolvedConfig> {
        if self.package_id.trim().is_empty() {
            return Err(Error::InvalidConfig("package id is required".into()));
        }
        validate_enclave_name(&self.enclave_name)?;
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("timeout must be positive".into()));
        }
        if self.parallelism == 0 {
            return Err(Error::InvalidConfig("parallelism must be positive".into()));
        }
        self.effective_config()?.resolve()
    }

    fn effective_config(&self) -> Result<ConfigSource> {
        let has_overrides = !self.participants.is_empty()
            || self.chain_id.is_some()
            || !self.additional_services.is_empty();

        match &self.config {
            ConfigSource::Built(config) => {
                let mut config = config.clone();
                if !self.participants.is_empty() {
                    config.participants = self.participants.clone();
                }
                if let Some(chain_id) = self.chain_id {
                    config
                        .network_params
                        .get_or_insert_with(NetworkParams::default)
                        .network_id = chain_id.to_string();
                }
                for service in &self.additional_services {
                    if !config.additional_services.contains(service) {
                        config.additional_services.push(service.clone());
                    }
                }
                Ok(ConfigSource::Built(config))
            }
            _ if has_overrides => Err(Error::InvalidConfig(
                "participant and network overrides need a built NetworkConfig, not raw YAML"
                    .into(),
            )),
            source => Ok(source.clone()),
        }
    }

    fn resolve_engine(&self) -> Result<Arc<dyn OrchestrationEngine>> {
        match &self.engine {
            Some(engine) => Ok(Arc::clone(engine)),
            None => Ok(Arc::new(KurtosisCli::new(self.binary.clone())?)),
        }
    }

    async fn launch(
        &self,
        engine: Arc<dyn OrchestrationEngine>,
        config: ResolvedConfig,
    ) -> Result<Network> {
        let enclave = self.enclave_name.clone();
        tracing::info!(
            "Starting devnet in enclave {} (package {}, chain id {}{})",
            enclave,
            self.package_id,
            config.chain_id,
            if self.dry_run { ", dry run" } else { "" }
        );

        let request = RunPackageRequest {
            package_id: self.package_id.clone(),
            enclave_name: enclave.clone(),
            config_yaml: config.yaml,
            dry_run: self.dry_run,
            parallelism: self.parallelism,
            verbose: self.verbose,
        };
        let result = engine
            .run_package(&self.cancel, &request)
            .await
            .map_err(|e| Error::Submission {
                enclave: enclave.clone(),
                source: Box::new(e),
            })?;
        for line in &result.response_lines {
            tracing::debug!("{}", line);
        }

        if self.dry_run {
            tracing::info!("Dry run, not waiting for services in {}", enclave);
        } else if let Err(e) = engine
            .wait_for_services(&self.cancel, &enclave, &[], self.timeout)
            .await
        {
            teardown_quietly(&engine, &enclave).await;
            return Err(Error::Readiness {
                enclave,
                source: Box::new(e),
            });
        }

        let discovered = match engine.get_services(&self.cancel, &enclave).await {
            Ok(services) => {
                map_services(&services, self.mapping_context(&engine, config.chain_id))
            }
            Err(e) => Err(e),
        };
        let network = match discovered {
            Ok(network) => network,
            Err(e) => {
                teardown_quietly(&engine, &enclave).await;
                return Err(Error::Discovery {
                    enclave,
                    source: Box::new(e),
                });
            }
        };

        if let Some((execution, consensus)) = &self.client_waits {
            if let Err(e) = network
                .wait_for_clients(&self.cancel, execution.as_ref(), consensus.as_ref())
                .await
            {
                if let Err(cleanup) = network.cleanup().await {
                    tracing::warn!("Failed to tear down enclave {}: {}", enclave, cleanup);
                }
                return Err(Error::Readiness {
                    enclave,
                    source: Box::new(e),
                });
            }
        }

        if self.wait_for_genesis && !self.dry_run {
            if let Err(e) = wait_for_genesis(&network, &self.cancel, self.timeout).await {
                return Err(Error::GenesisWait {
                    network: Box::new(network),
                    source: Box::new(e),
                });
            }
        }

        tracing::info!(
            "Devnet {} ready: {} execution, {} consensus clients",
            enclave,
            network.execution_clients().count(),
            network.consensus_clients().count()
        );
        Ok(network)
    }

    fn mapping_context(
        &self,
        engine: &Arc<dyn OrchestrationEngine>,
        chain_id: u64,
    ) -> MappingContext {
        MappingContext {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| self.enclave_name.clone()),
            chain_id,
            enclave_name: self.enclave_name.clone(),
            teardown: Some(destroy_enclave(Arc::clone(engine), self.enclave_name.clone())),
            auto_cleanup: !self.orphan,
        }
    }
}

/// Teardown that destroys `enclave`, independent of the caller's cancellation
fn destroy_enclave(engine: Arc<dyn OrchestrationEngine>, enclave: String) -> Teardown {
    Box::new(move || {
        async move {
            tracing::info!("Destroying enclave {}", enclave);
            engine
                .destroy_enclave(&CancellationToken::new(), &enclave)
                .await
        }
        .boxed()
    })
}

async fn teardown_quietly(engine: &Arc<dyn OrchestrationEngine>, enclave: &str) {
    tracing::info!("Tearing down enclave {} after failed launch", enclave);
    if let Err(e) = engine
        .destroy_enclave(&CancellationToken::new(), enclave)
        .await
    {
        tracing::warn!("Failed to tear down enclave {}: {}", enclave, e);
    }
}

async fn wait_for_genesis(
    network: &Network,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<()> {
    let Some(client) = network
        .consensus_clients()
        .all()
        .into_iter()
        .min_by(|a, b| a.name().cmp(b.name()))
    else {
        return Err(Error::Rpc(
            "no consensus client to read the genesis time from".into(),
        ));
    };

    let resource = format!("genesis time from {}", client.name());
    let genesis_time = poll_until(&resource, GENESIS_POLL_INTERVAL, timeout, cancel, || async move {
        match client.genesis_time().await {
            Ok(time) => Ok(Some(time)),
            Err(e) => {
                tracing::debug!("Genesis time not available yet: {}", e);
                Ok(None)
            }
        }
    })
    .await?;

    let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
    if genesis_time > now {
        let delay = Duration::from_secs(genesis_time - now);
        tracing::info!("Waiting {}s for genesis", delay.as_secs());
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    Ok(())
}

fn generate_enclave_name() -> String {
    format!(
        "devnet-{}-{:06x}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        rand::random::<u32>() & 0x00ff_ffff
    )
}

fn validate_enclave_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidConfig("enclave name is required".into()));
    }
    if name.len() > MAX_ENCLAVE_NAME_LEN
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(Error::InvalidConfig(format!(
            "enclave name {name:?} must be at most {MAX_ENCLAVE_NAME_LEN} letters, digits or dashes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_type::ClientType;

    #[test]
    fn test_generated_enclave_names_are_valid() {
        let first = generate_enclave_name();
        let second = generate_enclave_name();
        assert!(first.starts_with("devnet-"));
        assert!(validate_enclave_name(&first).is_ok());
        assert_ne!(first, second);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let rejected = |builder: NetworkBuilder| {
            matches!(builder.prepare(), Err(Error::InvalidConfig(_)))
        };

        assert!(rejected(NetworkBuilder::new().package_id(" ")));
        assert!(rejected(NetworkBuilder::new().enclave_name("")));
        assert!(rejected(NetworkBuilder::new().enclave_name("has spaces")));
        assert!(rejected(NetworkBuilder::new().enclave_name("x".repeat(61))));
        assert!(rejected(NetworkBuilder::new().timeout(Duration::ZERO)));
        assert!(rejected(NetworkBuilder::new().parallelism(0)));
        assert!(rejected(
            NetworkBuilder::new().config_file("/no/such/network_params.yaml")
        ));
        assert!(NetworkBuilder::new().prepare().is_ok());
    }

    #[test]
    fn test_overrides_apply_to_built_config() {
        let builder = NetworkBuilder::new()
            .participant(Participant::new(ClientType::Reth, ClientType::Teku))
            .participant(Participant::new(ClientType::Besu, ClientType::Prysm).count(2))
            .chain_id(1337)
            .additional_service("dora")
            .additional_service("dora");

        let ConfigSource::Built(config) = builder.effective_config().unwrap() else {
            panic!("expected a built config");
        };
        assert_eq!(config.participants.len(), 2);
        assert_eq!(config.participants[0].el_type, ClientType::Reth);
        assert_eq!(config.additional_services, ["dora"]);
        assert_eq!(builder.prepare().unwrap().chain_id, 1337);
    }

    #[test]
    fn test_overrides_conflict_with_raw_yaml() {
        let builder = NetworkBuilder::new()
            .config_yaml("participants:\n  - el_type: geth\n    cl_type: teku\n")
            .chain_id(5);
        assert!(matches!(builder.prepare(), Err(Error::InvalidConfig(_))));

        let plain =
            NetworkBuilder::new().config_yaml("participants:\n  - el_type: geth\n    cl_type: teku\n");
        assert_eq!(plain.prepare().unwrap().chain_id, crate::DEFAULT_CHAIN_ID);
    }
}
