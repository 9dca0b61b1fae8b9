//! Multi-client Ethereum devnets for integration testing
//!
//! This crate launches Ethereum devnets through the Kurtosis orchestration engine
//! and the ethereum-package, waits for them to come up, and maps the services the
//! engine reports back into typed execution and consensus client handles.

mod binary;
mod builder;
mod client;
mod client_type;
mod config;
pub mod engine;
mod lifecycle;
mod mapper;
mod network;
mod rpc;
mod service;
pub mod wait;

pub use binary::{KurtosisBinary, KURTOSIS_BIN_ENV};
pub use builder::{NetworkBuilder, DEFAULT_PACKAGE_ID, PACKAGE_ENV};
pub use client::{Client, ClientCollection, ConsensusClient, ExecutionClient};
pub use client_type::{is_consensus, is_execution, ClientType, CONSENSUS_CLIENTS, EXECUTION_CLIENTS};
pub use config::{ConfigSource, NetworkConfig, NetworkParams, Participant, DEFAULT_CHAIN_ID};
pub use engine::{OrchestrationEngine, PortInfo, RunPackageRequest, RunPackageResult, ServiceInfo};
pub use lifecycle::{CleanupGate, CleanupRegistry, Teardown};
pub use mapper::{map_services, parse_service_name, KnownService, MappingContext, ServiceKind};
pub use network::Network;
pub use service::{ConfigServer, Port, Service, ServiceCategory};
pub use tokio_util::sync::CancellationToken;
pub use wait::{WaitStrategy, WaitTarget};

use std::time::Duration;

/// Result type used throughout this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when launching and managing devnets
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Engine binary not found or invalid: {0}")]
    InvalidBinary(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Failed to submit package to enclave {enclave}: {source}")]
    Submission {
        enclave: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Services in enclave {enclave} did not become ready: {source}")]
    Readiness {
        enclave: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to discover services in enclave {enclave}: {source}")]
    Discovery {
        enclave: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Network {} is running but genesis wait failed: {source}", .network.enclave_name())]
    GenesisWait {
        network: Box<Network>,
        #[source]
        source: Box<Error>,
    },

    #[error("Timed out after {}s waiting for {resource}", .timeout.as_secs_f64())]
    WaitTimeout { resource: String, timeout: Duration },

    #[error("Unsupported wait target: {0}")]
    UnsupportedTarget(String),

    #[error("Wait strategy {index} failed: {source}")]
    WaitStep {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Name of the launch stage that failed, for stage-wrapped errors.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            Self::InvalidConfig(_) => Some("configuration"),
            Self::Submission { .. } => Some("submission"),
            Self::Readiness { .. } => Some("readiness"),
            Self::Discovery { .. } => Some("discovery"),
            Self::GenesisWait { .. } => Some("genesis"),
            _ => None,
        }
    }

    /// Whether this error, or the error it wraps, is a wait timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::WaitTimeout { .. } => true,
            _ => self.inner().map(Error::is_timeout).unwrap_or(false),
        }
    }

    /// Whether this error, or the error it wraps, is an unsupported wait target.
    ///
    /// These never succeed on retry.
    pub fn is_unsupported_target(&self) -> bool {
        match self {
            Self::UnsupportedTarget(_) => true,
            _ => self
                .inner()
                .map(Error::is_unsupported_target)
                .unwrap_or(false),
        }
    }

    /// Whether this error, or the error it wraps, stems from cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            _ => self.inner().map(Error::is_cancelled).unwrap_or(false),
        }
    }

    /// Recover the live network from a post-creation failure.
    pub fn into_network(self) -> Option<Network> {
        match self {
            Self::GenesisWait { network, .. } => Some(*network),
            _ => None,
        }
    }

    fn inner(&self) -> Option<&Error> {
        match self {
            Self::Submission { source, .. }
            | Self::Readiness { source, .. }
            | Self::Discovery { source, .. }
            | Self::GenesisWait { source, .. }
            | Self::WaitStep { source, .. } => Some(source),
            _ => None,
        }
    }
}
