//! Maps the engine's flat service list onto a typed [`Network`].
//!
//! The ethereum-package names its containers by convention:
//!
//! | Service name | Meaning |
//! |---|---|
//! | `el-<n>-<el>-<cl>` | execution client of participant `n` |
//! | `cl-<n>-<cl>-<el>` | consensus (beacon) client of participant `n` |
//! | `vc-<n>-<el>-<cl>`, `cl-<n>-<cl>-<el>-validator` | validator client |
//! | `apache` | static server for the generated network configs |
//! | `prometheus`, `grafana` | monitoring |
//! | `dora`, `blockscout*` | block explorers |
//!
//! Names outside the convention map to [`ServiceKind::Other`]; unknown client
//! tokens map to [`ClientType::Unknown`]. Nothing is dropped.

use crate::{
    client::{ClientCollection, ConsensusClient, ExecutionClient},
    client_type::ClientType,
    engine::{PortInfo, ServiceInfo},
    lifecycle::Teardown,
    network::{Network, NetworkParts},
    service::{ConfigServer, Port, Service, ServiceCategory},
    Error, Result,
};
use std::collections::HashMap;

const RPC_PORTS: &[&str] = &["rpc"];
const WS_PORTS: &[&str] = &["ws"];
const ENGINE_PORTS: &[&str] = &["engine-rpc", "engine"];
const METRICS_PORTS: &[&str] = &["metrics"];
const P2P_PORTS: &[&str] = &["tcp-discovery", "p2p"];
const BEACON_PORTS: &[&str] = &["http", "beacon"];
const HTTP_PORTS: &[&str] = &["http"];

/// Auxiliary services recognised by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownService {
    ConfigServer,
    Prometheus,
    Grafana,
    Dora,
    Blockscout,
}

impl KnownService {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "apache" => Some(Self::ConfigServer),
            "prometheus" => Some(Self::Prometheus),
            "grafana" => Some(Self::Grafana),
            "dora" => Some(Self::Dora),
            _ if name == "blockscout" || name.starts_with("blockscout-") => Some(Self::Blockscout),
            _ => None,
        }
    }

    pub fn category(&self) -> ServiceCategory {
        match self {
            Self::ConfigServer => ServiceCategory::ConfigServer,
            Self::Prometheus | Self::Grafana => ServiceCategory::Monitoring,
            Self::Dora | Self::Blockscout => ServiceCategory::Explorer,
        }
    }
}

/// Classification of a single service name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Execution { client_type: ClientType, index: usize },
    Consensus { client_type: ClientType, index: usize },
    Validator { index: usize },
    Named(KnownService),
    Other,
}

impl ServiceKind {
    pub fn category(&self) -> ServiceCategory {
        match self {
            Self::Execution { .. } => ServiceCategory::ExecutionClient,
            Self::Consensus { .. } => ServiceCategory::ConsensusClient,
            Self::Validator { .. } => ServiceCategory::Validator,
            Self::Named(known) => known.category(),
            Self::Other => ServiceCategory::Other,
        }
    }

    /// Participant index, for services that belong to a participant
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Execution { index, .. }
            | Self::Consensus { index, .. }
            | Self::Validator { index } => Some(*index),
            Self::Named(_) | Self::Other => None,
        }
    }
}

/// Classify a service by its name
pub fn parse_service_name(name: &str) -> ServiceKind {
    let tokens: Vec<&str> = name.split('-').collect();

    let kind = match tokens.as_slice() {
        ["el", index, el, ..] => parse_index(index).map(|index| ServiceKind::Execution {
            client_type: ClientType::from_execution_token(el),
            index,
        }),
        ["cl", index, _, .., "validator"] => {
            parse_index(index).map(|index| ServiceKind::Validator { index })
        }
        ["cl", index, cl, ..] => parse_index(index).map(|index| ServiceKind::Consensus {
            client_type: ClientType::from_consensus_token(cl),
            index,
        }),
        ["vc", index, ..] => parse_index(index).map(|index| ServiceKind::Validator { index }),
        _ => KnownService::from_name(name).map(ServiceKind::Named),
    };

    kind.unwrap_or(ServiceKind::Other)
}

fn parse_index(token: &str) -> Option<usize> {
    token.parse().ok()
}

/// Identity and lifecycle settings for the network being assembled
pub struct MappingContext {
    pub name: String,
    pub chain_id: u64,
    pub enclave_name: String,
    /// Destroys the enclave; `None` leaves nothing to clean up
    pub teardown: Option<Teardown>,
    pub auto_cleanup: bool,
}

/// Build a [`Network`] from the services reported by the engine.
///
/// Performs no I/O. Fails only when the context itself is unusable.
pub fn map_services(
    services: &HashMap<String, ServiceInfo>,
    context: MappingContext,
) -> Result<Network> {
    if context.enclave_name.trim().is_empty() {
        return Err(Error::InvalidConfig(
            "an enclave name is required to map services".into(),
        ));
    }

    let mut entries: Vec<(ServiceKind, &str, &ServiceInfo)> = services
        .iter()
        .map(|(name, info)| (parse_service_name(name), name.as_str(), info))
        .collect();
    entries.sort_by(|a, b| {
        let a_index = a.0.index().unwrap_or(usize::MAX);
        let b_index = b.0.index().unwrap_or(usize::MAX);
        a_index.cmp(&b_index).then_with(|| a.1.cmp(b.1))
    });

    let mut parts = NetworkParts {
        name: context.name,
        chain_id: context.chain_id,
        enclave_name: context.enclave_name,
        execution_clients: ClientCollection::new(),
        consensus_clients: ClientCollection::new(),
        services: Vec::with_capacity(entries.len()),
        config_server: None,
        prometheus_url: None,
        grafana_url: None,
        explorer_url: None,
    };

    for (kind, name, info) in entries {
        tracing::trace!("Service {} classified as {:?}", name, kind);

        match kind {
            ServiceKind::Execution { client_type, index } => {
                if client_type.is_unknown() {
                    tracing::warn!("Execution service {} runs an unrecognised client", name);
                }
                parts
                    .execution_clients
                    .add(execution_client(name, client_type, index, info));
            }
            ServiceKind::Consensus { client_type, index } => {
                if client_type.is_unknown() {
                    tracing::warn!("Consensus service {} runs an unrecognised client", name);
                }
                parts
                    .consensus_clients
                    .add(consensus_client(name, client_type, index, info));
            }
            ServiceKind::Named(known) => {
                let url = Some(endpoint(info, HTTP_PORTS, "http")).filter(|url| !url.is_empty());
                match known {
                    KnownService::ConfigServer => {
                        parts.config_server = url.map(ConfigServer::new);
                    }
                    KnownService::Prometheus => parts.prometheus_url = url,
                    KnownService::Grafana => parts.grafana_url = url,
                    // Dora wins over blockscout when both run
                    KnownService::Dora => parts.explorer_url = url.or(parts.explorer_url),
                    KnownService::Blockscout => {
                        parts.explorer_url = parts.explorer_url.or(url);
                    }
                }
            }
            ServiceKind::Validator { .. } | ServiceKind::Other => {}
        }

        parts.services.push(Service::new(
            name,
            kind.category(),
            info.uuid.clone(),
            ports(&info.ports),
            info.status.clone(),
        ));
    }

    tracing::debug!(
        "Mapped enclave {}: {} execution, {} consensus, {} services",
        parts.enclave_name,
        parts.execution_clients.count(),
        parts.consensus_clients.count(),
        parts.services.len()
    );

    Ok(Network::new(parts, context.teardown, context.auto_cleanup))
}

fn execution_client(
    name: &str,
    client_type: ClientType,
    index: usize,
    info: &ServiceInfo,
) -> ExecutionClient {
    ExecutionClient::new(
        name,
        client_type,
        index,
        "",
        endpoint(info, RPC_PORTS, "http"),
        endpoint(info, WS_PORTS, "ws"),
        endpoint(info, ENGINE_PORTS, "http"),
        endpoint(info, METRICS_PORTS, "http"),
        "",
        port_number(info, P2P_PORTS),
    )
}

fn consensus_client(
    name: &str,
    client_type: ClientType,
    index: usize,
    info: &ServiceInfo,
) -> ConsensusClient {
    ConsensusClient::new(
        name,
        client_type,
        index,
        "",
        endpoint(info, BEACON_PORTS, "http"),
        endpoint(info, METRICS_PORTS, "http"),
        "",
        "",
        port_number(info, P2P_PORTS),
    )
}

fn find_port<'a>(info: &'a ServiceInfo, names: &[&str]) -> Option<&'a PortInfo> {
    names.iter().find_map(|name| info.ports.get(*name))
}

fn port_number(info: &ServiceInfo, names: &[&str]) -> u16 {
    find_port(info, names).map(|port| port.number).unwrap_or(0)
}

/// `scheme://host:port` for the first matching port, or an empty string.
///
/// A host-published URL takes precedence over the container address.
fn endpoint(info: &ServiceInfo, names: &[&str], scheme: &str) -> String {
    find_port(info, names)
        .and_then(|port| authority(info, port))
        .map(|authority| format!("{scheme}://{authority}"))
        .unwrap_or_default()
}

fn authority(info: &ServiceInfo, port: &PortInfo) -> Option<String> {
    if let Some(url) = port.url.as_deref() {
        let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        let authority = without_scheme.split('/').next().unwrap_or_default();
        if !authority.is_empty() {
            return Some(authority.to_string());
        }
    }

    let host = if info.ip_address.is_empty() {
        &info.hostname
    } else {
        &info.ip_address
    };
    if host.is_empty() {
        return None;
    }
    Some(format!("{}:{}", host, port.number))
}

fn ports(raw: &HashMap<String, PortInfo>) -> Vec<Port> {
    let mut ports: Vec<Port> = raw
        .iter()
        .map(|(name, port)| Port {
            name: name.clone(),
            number: port.number,
            protocol: port.protocol.clone(),
            url: port.url.clone(),
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}
