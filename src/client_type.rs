//! Registry of known execution and consensus client implementations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a client implementation running in the devnet.
///
/// Every known tag belongs to exactly one layer. Tags the registry does not know
/// resolve to [`ClientType::Unknown`], which is neither execution nor consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ClientType {
    // Execution layer
    Geth,
    Nethermind,
    Besu,
    Erigon,
    Reth,
    EthereumJs,
    NimbusEth1,
    Ethrex,

    // Consensus layer
    Lighthouse,
    Teku,
    Prysm,
    Nimbus,
    Lodestar,
    Grandine,

    Unknown,
}

/// Every execution client known to the registry.
pub const EXECUTION_CLIENTS: &[ClientType] = &[
    ClientType::Geth,
    ClientType::Nethermind,
    ClientType::Besu,
    ClientType::Erigon,
    ClientType::Reth,
    ClientType::EthereumJs,
    ClientType::NimbusEth1,
    ClientType::Ethrex,
];

/// Every consensus client known to the registry.
pub const CONSENSUS_CLIENTS: &[ClientType] = &[
    ClientType::Lighthouse,
    ClientType::Teku,
    ClientType::Prysm,
    ClientType::Nimbus,
    ClientType::Lodestar,
    ClientType::Grandine,
];

impl ClientType {
    /// The tag used by the ethereum-package for this client.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Geth => "geth",
            Self::Nethermind => "nethermind",
            Self::Besu => "besu",
            Self::Erigon => "erigon",
            Self::Reth => "reth",
            Self::EthereumJs => "ethereumjs",
            Self::NimbusEth1 => "nimbus-eth1",
            Self::Ethrex => "ethrex",
            Self::Lighthouse => "lighthouse",
            Self::Teku => "teku",
            Self::Prysm => "prysm",
            Self::Nimbus => "nimbus",
            Self::Lodestar => "lodestar",
            Self::Grandine => "grandine",
            Self::Unknown => "unknown",
        }
    }

    /// The value the ethereum-package expects in a participant's `el_type`.
    ///
    /// Differs from [`as_str`](Self::as_str) only for `NimbusEth1`, which the
    /// package calls `nimbus`.
    pub fn execution_tag(&self) -> &'static str {
        match self {
            Self::NimbusEth1 => "nimbus",
            other => other.as_str(),
        }
    }

    /// Resolve a tag. Matching is case-insensitive; unrecognized tags yield `Unknown`.
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim().to_ascii_lowercase();
        EXECUTION_CLIENTS
            .iter()
            .chain(CONSENSUS_CLIENTS.iter())
            .copied()
            .find(|client| client.as_str() == tag)
            .unwrap_or(Self::Unknown)
    }

    /// Resolve a token found in the execution slot of a service name.
    ///
    /// Service names carry `nimbus` for the nimbus execution client, so the token
    /// is interpreted as `NimbusEth1` here. Consensus tags resolve to `Unknown`.
    pub fn from_execution_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("nimbus") {
            return Self::NimbusEth1;
        }
        match Self::from_tag(token) {
            client if client.is_execution() => client,
            _ => Self::Unknown,
        }
    }

    /// Resolve a token found in the consensus slot of a service name.
    pub fn from_consensus_token(token: &str) -> Self {
        match Self::from_tag(token) {
            client if client.is_consensus() => client,
            _ => Self::Unknown,
        }
    }

    pub fn is_execution(&self) -> bool {
        EXECUTION_CLIENTS.contains(self)
    }

    pub fn is_consensus(&self) -> bool {
        CONSENSUS_CLIENTS.contains(self)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

/// Whether `tag` names a known execution client.
pub fn is_execution(tag: &str) -> bool {
    ClientType::from_tag(tag).is_execution()
}

/// Whether `tag` names a known consensus client.
pub fn is_consensus(tag: &str) -> bool {
    ClientType::from_tag(tag).is_consensus()
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ClientType> for String {
    fn from(client: ClientType) -> Self {
        client.as_str().to_string()
    }
}

impl From<String> for ClientType {
    fn from(tag: String) -> Self {
        Self::from_tag(&tag)
    }
}

impl From<&str> for ClientType {
    fn from(tag: &str) -> Self {
        Self::from_tag(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_tags_are_only_execution() {
        for client in EXECUTION_CLIENTS {
            assert!(is_execution(client.as_str()), "{client} should be execution");
            assert!(!is_consensus(client.as_str()), "{client} should not be consensus");
        }
    }

    #[test]
    fn test_consensus_tags_are_only_consensus() {
        for client in CONSENSUS_CLIENTS {
            assert!(is_consensus(client.as_str()), "{client} should be consensus");
            assert!(!is_execution(client.as_str()), "{client} should not be execution");
        }
    }

    #[test]
    fn test_unrecognized_tags_are_neither() {
        for tag in ["", "unknown", "parity", "geth-lighthouse", "el", "  "] {
            assert!(!is_execution(tag), "{tag:?}");
            assert!(!is_consensus(tag), "{tag:?}");
        }
    }

    #[test]
    fn test_from_tag_is_case_insensitive() {
        assert_eq!(ClientType::from_tag("Geth"), ClientType::Geth);
        assert_eq!(ClientType::from_tag(" LIGHTHOUSE "), ClientType::Lighthouse);
    }

    #[test]
    fn test_execution_tag_uses_package_names() {
        assert_eq!(ClientType::NimbusEth1.execution_tag(), "nimbus");
        assert_eq!(ClientType::NimbusEth1.as_str(), "nimbus-eth1");
        assert_eq!(ClientType::Geth.execution_tag(), "geth");
    }

    #[test]
    fn test_slot_specific_resolution() {
        assert_eq!(ClientType::from_execution_token("nimbus"), ClientType::NimbusEth1);
        assert_eq!(ClientType::from_consensus_token("nimbus"), ClientType::Nimbus);
        assert_eq!(ClientType::from_execution_token("teku"), ClientType::Unknown);
        assert_eq!(ClientType::from_consensus_token("besu"), ClientType::Unknown);
    }

    #[test]
    fn test_serde_uses_tag() {
        let json = serde_json::to_string(&ClientType::EthereumJs).unwrap();
        assert_eq!(json, "\"ethereumjs\"");
        let parsed: ClientType = serde_json::from_str("\"prysm\"").unwrap();
        assert_eq!(parsed, ClientType::Prysm);
    }
}
