//! Minimal JSON-RPC and Beacon API queries against running clients.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client shared by every handle in the process
///
/// Idle connections are not pooled: a pooled connection belongs to the runtime
/// that opened it and breaks once that runtime is dropped, as `build_sync` does.
pub(crate) fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_default()
    })
}

/// Issue a JSON-RPC 2.0 call and decode its `result`
pub(crate) async fn json_rpc<T: DeserializeOwned>(
    url: &str,
    method: &str,
    params: Value,
) -> Result<T> {
    if url.is_empty() {
        return Err(Error::Rpc(format!("no RPC endpoint available for {method}")));
    }

    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let response: Value = http_client()
        .post(url)
        .json(&body)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if let Some(error) = response.get("error") {
        return Err(Error::Rpc(format!("{method} failed: {error}")));
    }

    let result = response
        .get("result")
        .cloned()
        .ok_or_else(|| Error::Rpc(format!("{method} returned no result")))?;

    Ok(serde_json::from_value(result)?)
}

/// Parse a hex-encoded JSON-RPC quantity such as `0x1a`
pub(crate) fn parse_quantity(value: &str) -> Result<u64> {
    let digits = value.trim().trim_start_matches("0x");
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::Rpc(format!("invalid quantity {value:?}: {e}")))
}

#[derive(Debug, Deserialize)]
struct BeaconEnvelope<T> {
    data: T,
}

/// GET a Beacon API path and decode its `data` field
pub(crate) async fn beacon_get<T: DeserializeOwned>(base_url: &str, path: &str) -> Result<T> {
    if base_url.is_empty() {
        return Err(Error::Rpc(format!("no beacon endpoint available for {path}")));
    }

    let envelope: BeaconEnvelope<T> = http_client()
        .get(format!("{}{}", base_url.trim_end_matches('/'), path))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok(envelope.data)
}

/// GET a Beacon API path and return only the status code
pub(crate) async fn beacon_status(base_url: &str, path: &str) -> Result<reqwest::StatusCode> {
    if base_url.is_empty() {
        return Err(Error::Rpc(format!("no beacon endpoint available for {path}")));
    }

    let response = http_client()
        .get(format!("{}{}", base_url.trim_end_matches('/'), path))
        .send()
        .await?;

    Ok(response.status())
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BeaconGenesis {
    pub genesis_time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BeaconSyncing {
    pub is_syncing: bool,
    pub head_slot: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BeaconVersion {
    pub version: String,
}
