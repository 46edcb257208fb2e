//! Wire message schemas for the `dig/1` and `dig-discovery/1` overlay streams.
//!
//! Every request and response (or response header, for streamed bodies) is a
//! single UTF-8 JSON object. Binary bodies, when present, follow the header
//! separated by a single `\n`. Security-sensitive ops (identification,
//! verification, relay) reject unknown fields so a malformed or probing peer
//! fails parsing rather than silently ignoring extra data.

use serde::{Deserialize, Serialize};

/// One request frame on `dig/1`, tagged by `type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Fetch a store's full content.
    #[serde(rename = "GET_STORE_CONTENT")]
    GetStoreContent {
        /// Hex store id.
        #[serde(rename = "storeId")]
        store_id: String,
    },
    /// Fetch a byte range of a store.
    #[serde(rename = "GET_FILE_RANGE")]
    GetFileRange {
        /// Hex store id.
        #[serde(rename = "storeId")]
        store_id: String,
        /// Inclusive start offset.
        #[serde(rename = "rangeStart")]
        range_start: u64,
        /// Inclusive end offset.
        #[serde(rename = "rangeEnd")]
        range_end: u64,
        /// Optional chunk ordinal, echoed back for correlation.
        #[serde(rename = "chunkId", skip_serializing_if = "Option::is_none")]
        chunk_id: Option<usize>,
    },
    /// Initial greeting exchanged on connect.
    #[serde(rename = "HANDSHAKE", deny_unknown_fields)]
    Handshake {
        /// Hex-encoded Ed25519 public key of the sender, if offered.
        #[serde(rename = "publicKey", skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// §4.2 step 2: cheap probe for overlay membership.
    #[serde(rename = "DIG_NETWORK_IDENTIFICATION", deny_unknown_fields)]
    DigNetworkIdentification {},
    /// §4.2 step 3: challenge-response overlay membership proof.
    #[serde(rename = "VERIFY_OVERLAY_MEMBERSHIP", deny_unknown_fields)]
    VerifyOverlayMembership {
        /// Hex-encoded 16-byte challenge nonce.
        #[serde(rename = "challengeNonce")]
        challenge_nonce: String,
        /// Requested info fields (subset of `GetPeerInfo`'s vocabulary).
        requested: Vec<String>,
    },
    /// Query a peer for a subset of its public state.
    #[serde(rename = "GET_PEER_INFO")]
    GetPeerInfo {
        /// Requested fields: any of `stores`, `capabilities`, `overlayAddress`, `nodeType`.
        #[serde(rename = "requestedInfo")]
        requested_info: Vec<String>,
    },
    /// Ask a relay-capable peer to mediate a transfer between two other peers.
    #[serde(rename = "RELAY_COORDINATE_REQUEST", deny_unknown_fields)]
    RelayCoordinateRequest {
        /// Peer id of the receiver asking for relaying.
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        /// Peer id of the source that should connect to the relay.
        #[serde(rename = "targetPeerId")]
        target_peer_id: String,
        /// Optional store id hint, used for `store-unavailable` checks.
        #[serde(rename = "storeId", skip_serializing_if = "Option::is_none")]
        store_id: Option<String>,
    },
    /// Fetch relayed bytes for a previously established session.
    #[serde(rename = "RELAY_DATA", deny_unknown_fields)]
    RelayData {
        /// Session id returned by a prior `RELAY_COORDINATE_REQUEST`.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Store id being relayed.
        #[serde(rename = "storeId")]
        store_id: String,
        /// Optional byte range, for the range-relay variant.
        #[serde(rename = "rangeStart", skip_serializing_if = "Option::is_none")]
        range_start: Option<u64>,
        /// Optional byte range, for the range-relay variant.
        #[serde(rename = "rangeEnd", skip_serializing_if = "Option::is_none")]
        range_end: Option<u64>,
    },
    /// Tell a NAT-restricted source which relay to dial.
    #[serde(rename = "RELAY_CONNECTION_SIGNAL", deny_unknown_fields)]
    RelayConnectionSignal {
        /// Peer id of the chosen relay.
        #[serde(rename = "turnServerPeerId")]
        turn_server_peer_id: String,
        /// Dialable addresses for the chosen relay.
        #[serde(rename = "turnServerAddresses")]
        turn_server_addresses: Vec<String>,
    },
}

impl Request {
    /// The wire `type` tag for this request, used for logging.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::GetStoreContent { .. } => "GET_STORE_CONTENT",
            Request::GetFileRange { .. } => "GET_FILE_RANGE",
            Request::Handshake { .. } => "HANDSHAKE",
            Request::DigNetworkIdentification {} => "DIG_NETWORK_IDENTIFICATION",
            Request::VerifyOverlayMembership { .. } => "VERIFY_OVERLAY_MEMBERSHIP",
            Request::GetPeerInfo { .. } => "GET_PEER_INFO",
            Request::RelayCoordinateRequest { .. } => "RELAY_COORDINATE_REQUEST",
            Request::RelayData { .. } => "RELAY_DATA",
            Request::RelayConnectionSignal { .. } => "RELAY_CONNECTION_SIGNAL",
        }
    }
}

/// Header preceding a streamed `GET_STORE_CONTENT` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreContentHeader {
    /// Always `true` for a successful header.
    pub success: bool,
    /// Total size of the store in bytes.
    pub size: u64,
    /// Best-effort MIME hint.
    pub mime: String,
}

/// Header preceding a streamed `GET_FILE_RANGE` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRangeHeader {
    /// Always `true` for a successful header.
    pub success: bool,
    /// Number of bytes in this response's body.
    pub size: u64,
    /// Declared total size of the store.
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    /// Inclusive start offset served.
    #[serde(rename = "rangeStart")]
    pub range_start: u64,
    /// Inclusive end offset served.
    #[serde(rename = "rangeEnd")]
    pub range_end: u64,
    /// Echoed chunk ordinal, if the request carried one.
    #[serde(rename = "chunkId", skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<usize>,
    /// Always `true`: this is a partial-content response.
    #[serde(rename = "isPartial")]
    pub is_partial: bool,
}

/// A generic `{success:false, error:"..."}` response, optionally carrying
/// `totalSize` (used by the `invalid-range` error) or other diagnostic
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `false`.
    pub success: bool,
    /// Error tag from the taxonomy in §7 (e.g. `"invalid-range"`).
    pub error: String,
    /// Present only for `invalid-range` responses.
    #[serde(rename = "totalSize", skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

impl ErrorResponse {
    /// Build a bare error response with no extra fields.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            total_size: None,
        }
    }

    /// Build the `invalid-range` response, which additionally carries the
    /// store's declared total size.
    #[must_use]
    pub fn invalid_range(total_size: u64) -> Self {
        Self {
            success: false,
            error: "invalid-range".to_string(),
            total_size: Some(total_size),
        }
    }

    /// The response for a request naming an unknown message type (§6).
    #[must_use]
    pub fn unknown_op() -> Self {
        Self::new("unknown-op")
    }
}

/// Response to `HANDSHAKE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Protocol version of the responder.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    /// Feature identifiers the responder supports.
    #[serde(rename = "supportedFeatures")]
    pub supported_features: Vec<String>,
    /// Hex-encoded Ed25519 public key of the responder.
    #[serde(rename = "publicKey")]
    pub public_key: String,
    /// Free-form capability tags.
    #[serde(rename = "nodeCapabilities")]
    pub node_capabilities: Vec<String>,
    /// Number of stores the responder currently holds.
    #[serde(rename = "storeCount")]
    pub store_count: usize,
    /// Whether the responder accepts unsolicited inbound connections.
    #[serde(rename = "acceptsDirect")]
    pub accepts_direct: bool,
}

/// Response to `DIG_NETWORK_IDENTIFICATION`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentificationResponse {
    /// The responder's configured overlay id (default `mainnet`).
    #[serde(rename = "networkId")]
    pub network_id: String,
    /// Always `true`: confirms the responder speaks the overlay protocol.
    #[serde(rename = "isOverlayNode")]
    pub is_overlay_node: bool,
    /// Protocol version of the responder.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    /// Responder's wall-clock time, Unix seconds.
    pub timestamp: u64,
}

/// Response to `VERIFY_OVERLAY_MEMBERSHIP`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyMembershipResponse {
    /// The responder's overlay address, fixed-prefix colon-hex form.
    #[serde(rename = "overlayAddress")]
    pub overlay_address: String,
    /// Capability tags matching the requested subset.
    pub capabilities: Vec<String>,
    /// Store ids matching the requested subset, if asked for.
    pub stores: Vec<String>,
    /// Responder's wall-clock time, Unix seconds.
    pub timestamp: u64,
}

/// Response to `GET_PEER_INFO`; every field is optional since the requester
/// names a subset via `requestedInfo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerInfoResponse {
    /// Present if `stores` was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stores: Option<Vec<String>>,
    /// Present if `capabilities` was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    /// Present if `overlayAddress` was requested.
    #[serde(rename = "overlayAddress", skip_serializing_if = "Option::is_none")]
    pub overlay_address: Option<String>,
    /// Present if `nodeType` was requested.
    #[serde(rename = "nodeType", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
}

/// Successful response to `RELAY_COORDINATE_REQUEST`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayCoordinateResponse {
    /// Newly minted session id, scoped to this relay and transfer.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// The relay's own peer id (echoed for clarity).
    #[serde(rename = "relayPeerId")]
    pub relay_peer_id: String,
    /// Externally-reachable address the source should dial.
    #[serde(rename = "externalAddress")]
    pub external_address: String,
    /// Port the source should dial.
    #[serde(rename = "relayPort")]
    pub relay_port: u16,
}

/// Successful response to `RELAY_DATA` (non-streamed, base64 form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayDataResponse {
    /// Store id this data belongs to.
    #[serde(rename = "storeId")]
    pub store_id: String,
    /// Number of bytes in `data`.
    pub size: u64,
    /// Base64-encoded relayed bytes.
    pub data: String,
}

/// Response to `RELAY_CONNECTION_SIGNAL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySignalResponse {
    /// Acknowledges the dial attempt; does not guarantee the relay session
    /// will subsequently succeed.
    pub ok: bool,
}

/// Parse a raw JSON line into a [`Request`], returning `None` for an
/// unrecognized `type` tag so the caller can answer `unknown-op` (§6).
#[must_use]
pub fn parse_request(raw: &str) -> Option<Request> {
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_get_file_range() {
        let req = Request::GetFileRange {
            store_id: "ab".repeat(16),
            range_start: 0,
            range_end: 1023,
            chunk_id: Some(0),
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed = parse_request(&json).unwrap();
        match parsed {
            Request::GetFileRange {
                range_start,
                range_end,
                ..
            } => {
                assert_eq!(range_start, 0);
                assert_eq!(range_end, 1023);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"NOT_A_REAL_OP"}"#;
        assert!(parse_request(raw).is_none());
    }

    #[test]
    fn handshake_rejects_unknown_fields() {
        let raw = r#"{"type":"HANDSHAKE","publicKey":"ab","extra":"field"}"#;
        assert!(parse_request(raw).is_none());
    }

    #[test]
    fn invalid_range_error_carries_total_size() {
        let err = ErrorResponse::invalid_range(2048);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"totalSize\":2048"));
        assert!(json.contains("invalid-range"));
    }

    #[test]
    fn unknown_op_has_no_total_size() {
        let err = ErrorResponse::unknown_op();
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("totalSize"));
    }
}
