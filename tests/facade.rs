//! Launch flow against the in-memory engine

use async_trait::async_trait;
use ethereum_test_network::{
    engine::{EngineCall, MockEngine},
    CancellationToken, ClientType, Error, NetworkBuilder, PortInfo, ServiceCategory, ServiceInfo,
    WaitStrategy, WaitTarget,
};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn devnet_services() -> Vec<ServiceInfo> {
    vec![
        ServiceInfo::new("el-1-geth-lighthouse", "10.0.0.1")
            .with_port("rpc", PortInfo::new(8545))
            .with_port("engine-rpc", PortInfo::new(8551)),
        ServiceInfo::new("cl-1-lighthouse-geth", "10.0.0.2").with_port("http", PortInfo::new(4000)),
        ServiceInfo::new("vc-1-geth-lighthouse", "10.0.0.3"),
        ServiceInfo::new("apache", "10.0.0.4").with_port("http", PortInfo::new(80)),
    ]
}

fn is_destroy(call: &EngineCall) -> bool {
    matches!(call, EngineCall::DestroyEnclave(_))
}

fn builder(engine: &Arc<MockEngine>) -> NetworkBuilder {
    NetworkBuilder::new()
        .enclave_name("devnet-facade")
        .engine(engine.clone())
        .orphan(true)
}

#[tokio::test]
async fn test_launch_maps_discovered_services() -> anyhow::Result<()> {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));

    let network = builder(&engine).chain_id(1337).build().await?;

    assert_eq!(network.enclave_name(), "devnet-facade");
    assert_eq!(network.chain_id(), 1337);
    let geth = network.execution_clients().by_type(ClientType::Geth);
    assert_eq!(geth.len(), 1);
    assert_eq!(geth[0].rpc_url(), "http://10.0.0.1:8545");
    assert_eq!(geth[0].engine_url(), "http://10.0.0.1:8551");
    assert_eq!(network.consensus_clients().count(), 1);
    assert_eq!(network.services().len(), 4);
    assert!(network
        .services()
        .iter()
        .any(|s| s.category() == ServiceCategory::Validator));
    assert_eq!(
        network.config_server().map(|c| c.url()),
        Some("http://10.0.0.4:80")
    );

    assert_eq!(
        engine.calls(),
        vec![
            EngineCall::RunPackage {
                enclave: "devnet-facade".into(),
                dry_run: false
            },
            EngineCall::WaitForServices("devnet-facade".into()),
            EngineCall::GetServices("devnet-facade".into()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_dry_run_skips_readiness_wait() -> anyhow::Result<()> {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));

    let network = builder(&engine).dry_run(true).build().await?;

    assert_eq!(
        engine.count_calls(|call| matches!(call, EngineCall::WaitForServices(_))),
        0
    );
    assert!(network.execution_clients().is_empty());
    assert!(network.services().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_readiness_failure_tears_down() {
    let engine = Arc::new(
        MockEngine::new()
            .with_services(devnet_services())
            .fail_wait_for_services(),
    );

    let err = builder(&engine).build().await.unwrap_err();

    assert!(matches!(err, Error::Readiness { .. }));
    assert_eq!(err.stage(), Some("readiness"));
    assert!(err.is_timeout());
    assert_eq!(engine.count_calls(is_destroy), 1);
    assert!(!engine.has_enclave("devnet-facade"));
}

#[tokio::test]
async fn test_discovery_failure_tears_down() {
    let engine = Arc::new(
        MockEngine::new()
            .with_services(devnet_services())
            .fail_get_services("inspect failed"),
    );

    let err = builder(&engine).build().await.unwrap_err();

    assert!(matches!(err, Error::Discovery { .. }));
    assert!(err.to_string().contains("inspect failed"));
    assert_eq!(engine.count_calls(is_destroy), 1);
}

#[tokio::test]
async fn test_teardown_failure_does_not_mask_error() {
    let engine = Arc::new(
        MockEngine::new()
            .with_services(devnet_services())
            .fail_wait_for_services()
            .fail_destroy("engine gone"),
    );

    let err = builder(&engine).build().await.unwrap_err();

    assert!(matches!(err, Error::Readiness { .. }));
    assert!(!err.to_string().contains("engine gone"));
}

#[tokio::test]
async fn test_submission_failure_has_nothing_to_tear_down() {
    let engine = Arc::new(MockEngine::new().fail_run_package("package rejected"));

    let err = builder(&engine).build().await.unwrap_err();

    assert_eq!(err.stage(), Some("submission"));
    assert!(err.to_string().contains("package rejected"));
    assert_eq!(engine.count_calls(is_destroy), 0);
}

#[tokio::test]
async fn test_invalid_config_makes_no_engine_calls() {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));

    let err = builder(&engine).enclave_name("").build().await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    let err = builder(&engine)
        .timeout(std::time::Duration::ZERO)
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    let err = builder(&engine).package_id("").build().await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_cancelled_launch() {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = builder(&engine)
        .cancel_token(cancel)
        .build()
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_find_or_create_reuses_existing_enclave() -> anyhow::Result<()> {
    let engine = Arc::new(MockEngine::new().with_enclave("shared", devnet_services()));

    let network = NetworkBuilder::new()
        .engine(engine.clone())
        .orphan(true)
        .find_or_create("shared")
        .await?;

    assert_eq!(network.enclave_name(), "shared");
    assert_eq!(network.execution_clients().count(), 1);
    assert_eq!(
        engine.count_calls(|call| matches!(call, EngineCall::RunPackage { .. })),
        0
    );
    Ok(())
}

#[tokio::test]
async fn test_find_or_create_launches_missing_enclave() -> anyhow::Result<()> {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));

    let network = NetworkBuilder::new()
        .engine(engine.clone())
        .orphan(true)
        .find_or_create("fresh")
        .await?;

    assert_eq!(network.consensus_clients().count(), 1);
    assert_eq!(
        engine.count_calls(|call| matches!(call, EngineCall::RunPackage { .. })),
        1
    );
    assert!(engine.has_enclave("fresh"));
    Ok(())
}

#[tokio::test]
async fn test_cleanup_destroys_enclave_once() -> anyhow::Result<()> {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));
    let network = builder(&engine).build().await?;

    network.cleanup().await?;
    network.cleanup().await?;
    network.cleanup().await?;

    assert_eq!(engine.count_calls(is_destroy), 1);
    assert!(!engine.has_enclave("devnet-facade"));
    assert!(network.is_cleaned_up());
    Ok(())
}

#[tokio::test]
async fn test_stop_keeps_enclave() -> anyhow::Result<()> {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));
    let network = builder(&engine).build().await?;

    network.stop(&CancellationToken::new()).await?;

    assert!(engine.has_enclave("devnet-facade"));
    assert_eq!(engine.count_calls(is_destroy), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_drop_destroys_armed_network() -> anyhow::Result<()> {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));
    let network = builder(&engine).orphan(false).build().await?;
    assert!(network.auto_cleanup());

    drop(network);

    assert_eq!(engine.count_calls(is_destroy), 1);
    Ok(())
}

#[tokio::test]
async fn test_orphaned_network_outlives_drop() -> anyhow::Result<()> {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));
    let network = builder(&engine).build().await?;

    drop(network);

    assert!(engine.has_enclave("devnet-facade"));
    assert_eq!(engine.count_calls(is_destroy), 0);
    Ok(())
}

#[tokio::test]
async fn test_genesis_failure_returns_live_network() {
    // Only an execution client: there is no beacon node to read genesis from
    let engine = Arc::new(MockEngine::new().with_services([ServiceInfo::new(
        "el-1-geth-lighthouse",
        "10.0.0.1",
    )]));

    let err = builder(&engine)
        .wait_for_genesis(true)
        .build()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some("genesis"));
    assert_eq!(engine.count_calls(is_destroy), 0);
    let network = err.into_network().expect("network survives genesis failure");
    assert_eq!(network.execution_clients().count(), 1);
}

#[tokio::test]
async fn test_genesis_in_the_past_does_not_block() -> anyhow::Result<()> {
    let beacon = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/eth/v1/beacon/genesis"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"data": {"genesis_time": "1600000000"}})),
        )
        .mount(&beacon)
        .await;

    let engine = Arc::new(MockEngine::new().with_services([ServiceInfo::new(
        "cl-1-teku-besu",
        "10.0.0.2",
    )
    .with_port("http", PortInfo::new(4000).with_url(beacon.uri()))]));

    let network = builder(&engine).wait_for_genesis(true).build().await?;
    assert_eq!(
        network.consensus_clients().by_type(ClientType::Teku)[0].beacon_url(),
        beacon.uri()
    );
    Ok(())
}

struct RejectConsensus;

#[async_trait]
impl WaitStrategy for RejectConsensus {
    async fn wait_until_ready(
        &self,
        _cancel: &CancellationToken,
        target: &dyn WaitTarget,
    ) -> ethereum_test_network::Result<()> {
        Err(Error::UnsupportedTarget(target.describe()))
    }
}

struct Accept;

#[async_trait]
impl WaitStrategy for Accept {
    async fn wait_until_ready(
        &self,
        _cancel: &CancellationToken,
        _target: &dyn WaitTarget,
    ) -> ethereum_test_network::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_client_wait_failure_tears_down() {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));

    let err = builder(&engine)
        .client_wait_strategies(Accept, RejectConsensus)
        .build()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some("readiness"));
    assert!(err.is_unsupported_target());
    assert_eq!(engine.count_calls(is_destroy), 1);
}

#[tokio::test]
async fn test_client_waits_pass() -> anyhow::Result<()> {
    let engine = Arc::new(MockEngine::new().with_services(devnet_services()));

    let network = builder(&engine)
        .client_wait_strategies(Accept, Accept)
        .build()
        .await?;
    assert_eq!(network.execution_clients().count(), 1);
    Ok(())
}
