use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad category of a discovered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    ExecutionClient,
    ConsensusClient,
    Validator,
    ConfigServer,
    Monitoring,
    Explorer,
    Other,
}

impl ServiceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionClient => "execution_client",
            Self::ConsensusClient => "consensus_client",
            Self::Validator => "validator",
            Self::ConfigServer => "config_server",
            Self::Monitoring => "monitoring",
            Self::Explorer => "explorer",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port exposed by a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub number: u16,
    pub protocol: String,
    /// Address reachable from the host, when the engine publishes one
    pub url: Option<String>,
}

/// Any container discovered in the enclave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub(crate) name: String,
    pub(crate) category: ServiceCategory,
    pub(crate) container_id: String,
    pub(crate) ports: Vec<Port>,
    pub(crate) status: String,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        category: ServiceCategory,
        container_id: impl Into<String>,
        ports: Vec<Port>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            container_id: container_id.into(),
            ports,
            status: status.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> ServiceCategory {
        self.category
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn status(&self) -> &str {
        &self.status
    }
}

/// Static file server publishing the generated network configuration
///
/// Paths follow the layout the ethereum-package uploads under `network-configs/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigServer {
    url: String,
}

impl ConfigServer {
    pub const GENESIS_STATE_PATH: &'static str = "/network-configs/genesis.ssz";
    pub const CHAIN_CONFIG_PATH: &'static str = "/network-configs/config.yaml";
    pub const BOOT_NODES_PATH: &'static str = "/network-configs/boot_enr.yaml";
    pub const DEPOSIT_CONTRACT_BLOCK_PATH: &'static str =
        "/network-configs/deposit_contract_block.txt";

    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn genesis_state_url(&self) -> String {
        format!("{}{}", self.url, Self::GENESIS_STATE_PATH)
    }

    pub fn chain_config_url(&self) -> String {
        format!("{}{}", self.url, Self::CHAIN_CONFIG_PATH)
    }

    pub fn boot_nodes_url(&self) -> String {
        format!("{}{}", self.url, Self::BOOT_NODES_PATH)
    }

    pub fn deposit_contract_block_url(&self) -> String {
        format!("{}{}", self.url, Self::DEPOSIT_CONTRACT_BLOCK_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_server_urls() {
        let server = ConfigServer::new("http://127.0.0.1:32800/");
        assert_eq!(server.url(), "http://127.0.0.1:32800");
        assert_eq!(
            server.genesis_state_url(),
            "http://127.0.0.1:32800/network-configs/genesis.ssz"
        );
        assert_eq!(
            server.boot_nodes_url(),
            "http://127.0.0.1:32800/network-configs/boot_enr.yaml"
        );
    }
}
