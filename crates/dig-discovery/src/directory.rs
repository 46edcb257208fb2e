//! External directory client (§6): an optional last-resort HTTPS peer
//! index and relay fallback, consulted only when DHT/gossip discovery
//! yields zero `verified-overlay` peers.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors talking to an external directory endpoint.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The endpoint returned 404: the caller must re-register before
    /// retrying.
    #[error("not registered, must re-register")]
    NotRegistered,
    /// The endpoint returned 429: back off before retrying.
    #[error("rate limited")]
    RateLimited,
    /// The endpoint returned 5xx: treat as transient and re-register.
    #[error("directory server error: {0}")]
    ServerError(u16),
    /// Transport-level failure (DNS, TLS, connection reset, timeout).
    #[error("request failed: {0}")]
    Request(String),
    /// The response body did not match the expected schema.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        DirectoryError::Request(err.to_string())
    }
}

/// Body of `POST /register`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    /// This node's stable peer id.
    #[serde(rename = "peerId")]
    pub peer_id: String,
    /// Dialable addresses for this node.
    pub addresses: Vec<String>,
    /// Store ids this node currently hosts.
    pub stores: Vec<String>,
    /// Capability tags (§3).
    pub capabilities: Vec<String>,
    /// Whether this node can relay for others.
    #[serde(rename = "relayCapable")]
    pub relay_capable: bool,
    /// Relay-dialable addresses, present only if `relay_capable`.
    #[serde(rename = "relayAddresses", skip_serializing_if = "Option::is_none")]
    pub relay_addresses: Option<Vec<String>>,
    /// Overlay network id.
    #[serde(rename = "networkId")]
    pub network_id: String,
    /// This node's software version string.
    #[serde(rename = "softwareVersion")]
    pub software_version: String,
}

/// One peer entry from `GET /peers`.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryPeer {
    /// Peer's stable id.
    #[serde(rename = "peerId")]
    pub peer_id: String,
    /// Dialable addresses.
    pub addresses: Vec<String>,
    /// Store ids, present when `includeStores=true` was requested.
    #[serde(default)]
    pub stores: Vec<String>,
    /// Capability tags, present when `includeCapabilities=true` was
    /// requested.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    #[serde(rename = "peerId")]
    peer_id: &'a str,
}

/// Body of `POST /relay-store`: the last-resort relay path when no
/// overlay relay succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStoreRequest {
    /// Store id being requested.
    #[serde(rename = "storeId")]
    pub store_id: String,
    /// Optional byte range.
    #[serde(rename = "rangeStart", skip_serializing_if = "Option::is_none")]
    pub range_start: Option<u64>,
    /// Optional byte range.
    #[serde(rename = "rangeEnd", skip_serializing_if = "Option::is_none")]
    pub range_end: Option<u64>,
}

/// HTTPS client for one configured directory endpoint.
#[derive(Clone)]
pub struct DirectoryClient {
    base_url: String,
    http: reqwest::Client,
}

impl DirectoryClient {
    /// Build a client for `base_url` (e.g. `https://directory.example.com`).
    #[must_use]
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    /// `POST /register`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] on any non-2xx response or transport
    /// failure.
    pub async fn register(&self, request: &RegisterRequest) -> Result<(), DirectoryError> {
        let response = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(request)
            .send()
            .await?;
        Self::check_status(response.status().as_u16())?;
        Ok(())
    }

    /// `GET /peers?includeStores=true&includeCapabilities=true`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] on any non-2xx response, transport
    /// failure, or malformed body.
    pub async fn get_peers(&self) -> Result<Vec<DirectoryPeer>, DirectoryError> {
        let response = self
            .http
            .get(format!("{}/peers", self.base_url))
            .query(&[("includeStores", "true"), ("includeCapabilities", "true")])
            .send()
            .await?;
        Self::check_status(response.status().as_u16())?;
        response
            .json::<Vec<DirectoryPeer>>()
            .await
            .map_err(|e| DirectoryError::Malformed(e.to_string()))
    }

    /// `POST /heartbeat`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotRegistered`] on `404` (caller must
    /// re-register), [`DirectoryError::RateLimited`] on `429`, or
    /// [`DirectoryError::ServerError`] on `5xx`.
    pub async fn heartbeat(&self, peer_id: &str) -> Result<(), DirectoryError> {
        let response = self
            .http
            .post(format!("{}/heartbeat", self.base_url))
            .json(&HeartbeatRequest { peer_id })
            .send()
            .await?;
        Self::check_status(response.status().as_u16())?;
        Ok(())
    }

    /// `POST /relay-store`: last-resort relay fallback, returning the raw
    /// bytes of the requested store or range.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] on any non-2xx response or transport
    /// failure.
    pub async fn relay_store(&self, request: &RelayStoreRequest) -> Result<Vec<u8>, DirectoryError> {
        let response = self
            .http
            .post(format!("{}/relay-store", self.base_url))
            .json(request)
            .send()
            .await?;
        Self::check_status(response.status().as_u16())?;
        Ok(response.bytes().await?.to_vec())
    }

    fn check_status(status: u16) -> Result<(), DirectoryError> {
        match status {
            200..=299 => Ok(()),
            404 => Err(DirectoryError::NotRegistered),
            429 => Err(DirectoryError::RateLimited),
            500..=599 => Err(DirectoryError::ServerError(status)),
            other => Err(DirectoryError::ServerError(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec() {
        assert!(matches!(
            DirectoryClient::check_status(404),
            Err(DirectoryError::NotRegistered)
        ));
        assert!(matches!(
            DirectoryClient::check_status(429),
            Err(DirectoryError::RateLimited)
        ));
        assert!(matches!(
            DirectoryClient::check_status(503),
            Err(DirectoryError::ServerError(503))
        ));
        assert!(DirectoryClient::check_status(200).is_ok());
    }

    #[test]
    fn register_request_serializes_camel_case() {
        let req = RegisterRequest {
            peer_id: "peer-1".to_string(),
            addresses: vec!["1.2.3.4:4001".to_string()],
            stores: vec![],
            capabilities: vec!["relay-use".to_string()],
            relay_capable: false,
            relay_addresses: None,
            network_id: "mainnet".to_string(),
            software_version: "0.1.0".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"peerId\""));
        assert!(json.contains("\"relayCapable\""));
        assert!(!json.contains("relayAddresses"));
    }
}
