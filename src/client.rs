use crate::{
    client_type::ClientType,
    rpc,
    wait::{HealthCheck, SyncCheck, WaitTarget},
    Error, Result,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Common view over execution and consensus client handles
pub trait Client {
    fn name(&self) -> &str;
    fn client_type(&self) -> ClientType;
}

/// A running execution client discovered in the enclave
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionClient {
    name: String,
    client_type: ClientType,
    index: usize,
    version: String,
    rpc_url: String,
    ws_url: String,
    engine_url: String,
    metrics_url: String,
    enode: String,
    p2p_port: u16,
}

impl ExecutionClient {
    /// Endpoints the service does not expose are left empty.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        client_type: ClientType,
        index: usize,
        version: impl Into<String>,
        rpc_url: impl Into<String>,
        ws_url: impl Into<String>,
        engine_url: impl Into<String>,
        metrics_url: impl Into<String>,
        enode: impl Into<String>,
        p2p_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            client_type,
            index,
            version: version.into(),
            rpc_url: rpc_url.into(),
            ws_url: ws_url.into(),
            engine_url: engine_url.into(),
            metrics_url: metrics_url.into(),
            enode: enode.into(),
            p2p_port,
        }
    }

    /// Participant index from the service name (1-based)
    pub fn index(&self) -> usize {
        self.index
    }

    /// Client version given at construction.
    ///
    /// Service discovery leaves it empty; [`client_version`](Self::client_version)
    /// asks the running node.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn engine_url(&self) -> &str {
        &self.engine_url
    }

    pub fn metrics_url(&self) -> &str {
        &self.metrics_url
    }

    /// Enode given at construction; service discovery leaves it empty
    pub fn enode(&self) -> &str {
        &self.enode
    }

    pub fn p2p_port(&self) -> u16 {
        self.p2p_port
    }

    pub async fn block_number(&self) -> Result<u64> {
        let height: String = rpc::json_rpc(&self.rpc_url, "eth_blockNumber", json!([])).await?;
        rpc::parse_quantity(&height)
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let id: String = rpc::json_rpc(&self.rpc_url, "eth_chainId", json!([])).await?;
        rpc::parse_quantity(&id)
    }

    pub async fn peer_count(&self) -> Result<u64> {
        let count: String = rpc::json_rpc(&self.rpc_url, "net_peerCount", json!([])).await?;
        rpc::parse_quantity(&count)
    }

    /// `eth_syncing` returns `false` once synced and a progress object otherwise.
    pub async fn is_syncing(&self) -> Result<bool> {
        let status: serde_json::Value =
            rpc::json_rpc(&self.rpc_url, "eth_syncing", json!([])).await?;
        Ok(status != serde_json::Value::Bool(false))
    }

    /// Query the node's version string
    pub async fn client_version(&self) -> Result<String> {
        rpc::json_rpc(&self.rpc_url, "web3_clientVersion", json!([])).await
    }
}

impl Client for ExecutionClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_type(&self) -> ClientType {
        self.client_type
    }
}

#[async_trait]
impl SyncCheck for ExecutionClient {
    async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if !self.is_syncing().await? {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(SYNC_POLL_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl HealthCheck for ExecutionClient {
    async fn is_healthy(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            height = self.block_number() => height.is_ok(),
        }
    }
}

impl WaitTarget for ExecutionClient {
    fn describe(&self) -> String {
        format!("execution client {}", self.name)
    }

    fn probe_url(&self) -> Option<String> {
        Some(self.rpc_url.clone())
    }

    fn sync_check(&self) -> Option<&dyn SyncCheck> {
        Some(self)
    }

    fn health_check(&self) -> Option<&dyn HealthCheck> {
        Some(self)
    }
}

/// A running consensus (beacon) client discovered in the enclave
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsensusClient {
    name: String,
    client_type: ClientType,
    index: usize,
    version: String,
    beacon_url: String,
    metrics_url: String,
    enr: String,
    peer_id: String,
    p2p_port: u16,
}

impl ConsensusClient {
    /// Endpoints the service does not expose are left empty.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        client_type: ClientType,
        index: usize,
        version: impl Into<String>,
        beacon_url: impl Into<String>,
        metrics_url: impl Into<String>,
        enr: impl Into<String>,
        peer_id: impl Into<String>,
        p2p_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            client_type,
            index,
            version: version.into(),
            beacon_url: beacon_url.into(),
            metrics_url: metrics_url.into(),
            enr: enr.into(),
            peer_id: peer_id.into(),
            p2p_port,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Client version given at construction.
    ///
    /// Service discovery leaves it empty; [`node_version`](Self::node_version)
    /// asks the running node.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn beacon_url(&self) -> &str {
        &self.beacon_url
    }

    pub fn metrics_url(&self) -> &str {
        &self.metrics_url
    }

    /// ENR given at construction; service discovery leaves it empty
    pub fn enr(&self) -> &str {
        &self.enr
    }

    /// Libp2p peer id given at construction; service discovery leaves it empty
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn p2p_port(&self) -> u16 {
        self.p2p_port
    }

    /// Network genesis time as a unix timestamp
    pub async fn genesis_time(&self) -> Result<u64> {
        let genesis: rpc::BeaconGenesis =
            rpc::beacon_get(&self.beacon_url, "/eth/v1/beacon/genesis").await?;
        genesis
            .genesis_time
            .parse()
            .map_err(|e| Error::Rpc(format!("invalid genesis time {:?}: {e}", genesis.genesis_time)))
    }

    pub async fn is_syncing(&self) -> Result<bool> {
        let status: rpc::BeaconSyncing =
            rpc::beacon_get(&self.beacon_url, "/eth/v1/node/syncing").await?;
        tracing::trace!("{} head slot {}", self.name, status.head_slot);
        Ok(status.is_syncing)
    }

    pub async fn node_version(&self) -> Result<String> {
        let version: rpc::BeaconVersion =
            rpc::beacon_get(&self.beacon_url, "/eth/v1/node/version").await?;
        Ok(version.version)
    }
}

impl Client for ConsensusClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_type(&self) -> ClientType {
        self.client_type
    }
}

#[async_trait]
impl SyncCheck for ConsensusClient {
    async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if !self.is_syncing().await? {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(SYNC_POLL_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl HealthCheck for ConsensusClient {
    async fn is_healthy(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            status = rpc::beacon_status(&self.beacon_url, crate::wait::BEACON_HEALTH_PATH) => {
                status.map(|s| s.is_success()).unwrap_or(false)
            }
        }
    }
}

impl WaitTarget for ConsensusClient {
    fn describe(&self) -> String {
        format!("consensus client {}", self.name)
    }

    fn probe_url(&self) -> Option<String> {
        Some(self.beacon_url.clone())
    }

    fn sync_check(&self) -> Option<&dyn SyncCheck> {
        Some(self)
    }

    fn health_check(&self) -> Option<&dyn HealthCheck> {
        Some(self)
    }
}

/// Client handles grouped by client type
///
/// Order is preserved within a type; [`ClientCollection::all`] makes no promise
/// about the order across types.
#[derive(Debug, Clone)]
pub struct ClientCollection<C> {
    by_type: HashMap<ClientType, Vec<C>>,
    total: usize,
}

impl<C> Default for ClientCollection<C> {
    fn default() -> Self {
        Self {
            by_type: HashMap::new(),
            total: 0,
        }
    }
}

impl<C: Client> ClientCollection<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a client under its own type
    pub fn add(&mut self, client: C) {
        self.by_type
            .entry(client.client_type())
            .or_default()
            .push(client);
        self.total += 1;
    }

    pub fn by_type(&self, client_type: ClientType) -> &[C] {
        self.by_type
            .get(&client_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all(&self) -> Vec<&C> {
        self.by_type.values().flatten().collect()
    }

    /// Look a client up by service name
    pub fn get(&self, name: &str) -> Option<&C> {
        self.by_type.values().flatten().find(|c| c.name() == name)
    }

    pub fn count(&self) -> usize {
        self.total
    }

    pub fn count_by_type(&self, client_type: ClientType) -> usize {
        self.by_type.get(&client_type).map(Vec::len).unwrap_or(0)
    }

    /// Client types with at least one client
    pub fn types(&self) -> Vec<ClientType> {
        let mut types: Vec<_> = self.by_type.keys().copied().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl<C: Client> FromIterator<C> for ClientCollection<C> {
    fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
        let mut collection = Self::new();
        for client in iter {
            collection.add(client);
        }
        collection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn execution(name: &str, client_type: ClientType) -> ExecutionClient {
        ExecutionClient::new(name, client_type, 1, "", "", "", "", "", "", 0)
    }

    #[test]
    fn test_collection_counts_are_consistent() {
        let clients = [
            ("el-1", ClientType::Geth),
            ("el-2", ClientType::Besu),
            ("el-3", ClientType::Geth),
            ("el-4", ClientType::Unknown),
            ("el-5", ClientType::Geth),
        ];
        let collection: ClientCollection<_> = clients
            .iter()
            .map(|(name, t)| execution(name, *t))
            .collect();

        let per_type: usize = collection
            .types()
            .into_iter()
            .map(|t| collection.count_by_type(t))
            .sum();
        assert_eq!(collection.count(), 5);
        assert_eq!(per_type, collection.count());
        assert_eq!(collection.all().len(), collection.count());
    }

    #[test]
    fn test_collection_preserves_order_within_type() {
        let mut collection = ClientCollection::new();
        collection.add(execution("el-1", ClientType::Geth));
        collection.add(execution("el-2", ClientType::Reth));
        collection.add(execution("el-3", ClientType::Geth));

        let names: Vec<_> = collection
            .by_type(ClientType::Geth)
            .iter()
            .map(|c| c.name())
            .collect();
        assert_eq!(names, ["el-1", "el-3"]);
        assert!(collection.by_type(ClientType::Teku).is_empty());
        assert_eq!(collection.count_by_type(ClientType::Teku), 0);
        assert_eq!(collection.get("el-2").unwrap().client_type(), ClientType::Reth);
    }

    #[tokio::test]
    async fn test_execution_queries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_syncing"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": false})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_blockNumber"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "0x2a"})),
            )
            .mount(&server)
            .await;

        let client = ExecutionClient::new(
            "el-1-geth-lighthouse",
            ClientType::Geth,
            1,
            "",
            server.uri(),
            "",
            "",
            "",
            "",
            0,
        );
        let cancel = CancellationToken::new();
        assert!(!client.is_syncing().await.unwrap());
        assert_eq!(client.block_number().await.unwrap(), 42);
        assert!(client.is_healthy(&cancel).await);
        client.wait_for_sync(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_consensus_queries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/node/health"))
            .respond_with(ResponseTemplate::new(206))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/beacon/genesis"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"genesis_time": "1700000000"}})),
            )
            .mount(&server)
            .await;

        let client = ConsensusClient::new(
            "cl-1-lighthouse-geth",
            ClientType::Lighthouse,
            1,
            "",
            server.uri(),
            "",
            "",
            "",
            0,
        );
        assert!(client.is_healthy(&CancellationToken::new()).await);
        assert_eq!(client.genesis_time().await.unwrap(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_unreachable_client_is_unhealthy() {
        let client = ConsensusClient::new("cl-1", ClientType::Teku, 1, "", "", "", "", "", 0);
        assert!(!client.is_healthy(&CancellationToken::new()).await);
    }
}
