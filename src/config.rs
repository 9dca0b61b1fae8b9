//! Arguments handed to the ethereum-package.
//!
//! Field names follow the package's own input schema.

use crate::{client_type::ClientType, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Network id the ethereum-package uses when none is configured
pub const DEFAULT_CHAIN_ID: u64 = 3_151_908;

/// One group of identical execution/consensus node pairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(with = "el_type_tag")]
    pub el_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub el_image: Option<String>,
    pub cl_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cl_image: Option<String>,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_count: Option<u32>,
}

fn default_count() -> u32 {
    1
}

/// `el_type` carries the package's execution tag, where nimbus is spelled `nimbus`
mod el_type_tag {
    use crate::client_type::ClientType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(client: &ClientType, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(client.execution_tag())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ClientType, D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag.trim().eq_ignore_ascii_case("nimbus") {
            Ok(ClientType::NimbusEth1)
        } else {
            Ok(ClientType::from_tag(&tag))
        }
    }
}

impl Participant {
    pub fn new(el_type: ClientType, cl_type: ClientType) -> Self {
        Self {
            el_type,
            el_image: None,
            cl_type,
            cl_image: None,
            count: 1,
            validator_count: None,
        }
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn el_image(mut self, image: impl Into<String>) -> Self {
        self.el_image = Some(image.into());
        self
    }

    pub fn cl_image(mut self, image: impl Into<String>) -> Self {
        self.cl_image = Some(image.into());
        self
    }

    pub fn validator_count(mut self, count: u32) -> Self {
        self.validator_count = Some(count);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    /// Chain id, written as a string like the package expects
    pub network_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_per_slot: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            network_id: DEFAULT_CHAIN_ID.to_string(),
            seconds_per_slot: None,
            genesis_delay: None,
            preset: None,
        }
    }
}

/// Arguments for one ethereum-package run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_params: Option<NetworkParams>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_log_level: Option<String>,
}

impl Default for NetworkConfig {
    /// A single geth/lighthouse pair
    fn default() -> Self {
        Self {
            participants: vec![Participant::new(ClientType::Geth, ClientType::Lighthouse)],
            network_params: None,
            additional_services: Vec::new(),
            global_log_level: None,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.participants.is_empty() {
            return Err(Error::InvalidConfig("at least one participant is required".into()));
        }
        for (i, participant) in self.participants.iter().enumerate() {
            if !participant.el_type.is_execution() {
                return Err(Error::InvalidConfig(format!(
                    "participant {i}: {} is not an execution client",
                    participant.el_type
                )));
            }
            if !participant.cl_type.is_consensus() {
                return Err(Error::InvalidConfig(format!(
                    "participant {i}: {} is not a consensus client",
                    participant.cl_type
                )));
            }
            if participant.count == 0 {
                return Err(Error::InvalidConfig(format!(
                    "participant {i}: count must be positive"
                )));
            }
        }
        if let Some(params) = &self.network_params {
            parse_chain_id(&params.network_id)?;
            if params.seconds_per_slot == Some(0) {
                return Err(Error::InvalidConfig("seconds_per_slot must be positive".into()));
            }
        }
        Ok(())
    }

    pub fn chain_id(&self) -> Result<u64> {
        match &self.network_params {
            Some(params) => parse_chain_id(&params.network_id),
            None => Ok(DEFAULT_CHAIN_ID),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn parse_chain_id(value: &str) -> Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(Error::InvalidConfig(format!(
            "network_id must be a positive integer, got {value:?}"
        ))),
    }
}

/// Where the package arguments come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Built(NetworkConfig),
    /// Raw YAML text, passed through untouched
    Yaml(String),
    File(PathBuf),
}

/// Package arguments ready for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedConfig {
    pub yaml: String,
    pub chain_id: u64,
}

impl ConfigSource {
    pub(crate) fn resolve(&self) -> Result<ResolvedConfig> {
        match self {
            Self::Built(config) => {
                config.validate()?;
                Ok(ResolvedConfig {
                    yaml: config.to_yaml()?,
                    chain_id: config.chain_id()?,
                })
            }
            Self::Yaml(yaml) => resolve_yaml(yaml.clone()),
            Self::File(path) => {
                let yaml = std::fs::read_to_string(path).map_err(|e| {
                    Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
                })?;
                resolve_yaml(yaml)
            }
        }
    }
}

fn resolve_yaml(yaml: String) -> Result<ResolvedConfig> {
    let document: serde_yaml::Value = serde_yaml::from_str(&yaml)
        .map_err(|e| Error::InvalidConfig(format!("invalid YAML: {e}")))?;
    if !document.is_mapping() {
        return Err(Error::InvalidConfig(
            "package arguments must be a YAML mapping".into(),
        ));
    }

    let chain_id = match document
        .get("network_params")
        .and_then(|params| params.get("network_id"))
    {
        None => DEFAULT_CHAIN_ID,
        Some(serde_yaml::Value::String(id)) => parse_chain_id(id)?,
        Some(serde_yaml::Value::Number(id)) => parse_chain_id(&id.to_string())?,
        Some(other) => {
            return Err(Error::InvalidConfig(format!(
                "network_id must be a string or integer, got {other:?}"
            )))
        }
    };

    Ok(ResolvedConfig { yaml, chain_id })
}
