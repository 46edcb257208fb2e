//! `dig/1` wire-protocol hardening: unknown ops, invalid ranges,
//! not-found stores, and the registry gate's reactive classification
//! between two real nodes talking over the shared in-memory fabric.

use std::sync::Arc;
use std::time::Duration;

use dig_core::node::protocol::{ErrorResponse, FileRangeHeader, StoreContentHeader};
use dig_core::node::DirectTransport;
use dig_core::{Node, NodeConfig};
use dig_tests::{seed_store, test_config, Network};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn spawn_node(network: &Network, seed_byte: u8, network_id: &str) -> (String, Arc<dig_tests::NetworkFabric>, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config: NodeConfig = test_config(dir.path(), seed_byte);
    config.network_id = network_id.to_string();
    let node = Arc::new(Node::new(config).unwrap());
    let peer_id = node.local_peer_id().clone();
    let fabric = network.join(node);
    (peer_id, fabric, dir)
}

async fn read_line(stream: &mut dig_core::node::BoxedStream) -> String {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[..n]).to_string()
}

#[tokio::test]
async fn unknown_op_is_rejected() {
    let network = Network::new();
    let (b_peer, _b_fabric, _b_dir) = spawn_node(&network, 30, "mainnet").await;
    let (_a_peer, a_fabric, _a_dir) = spawn_node(&network, 31, "mainnet").await;

    let mut stream = a_fabric.dial(&b_peer, "dig/1", Duration::from_secs(2)).await.unwrap();
    stream.write_all(b"{\"type\":\"NOT_A_REAL_OP\"}\n").await.unwrap();
    let line = read_line(&mut stream).await;
    let response: ErrorResponse = serde_json::from_str(line.lines().next().unwrap()).unwrap();
    assert_eq!(response.error, "unknown-op");
}

#[tokio::test]
async fn peer_from_a_different_network_id_is_denied_gated_ops() {
    let network = Network::new();
    let (a_peer, a_fabric, a_dir) = spawn_node(&network, 32, "mainnet").await;
    seed_store(a_dir.path(), "store-x", b"secret").await;
    let (_b_peer, b_fabric, _b_dir) = spawn_node(&network, 33, "sidechain").await;

    // `b` (a different overlay network) dials `a` and asks for a store;
    // `a`'s classifier dials back into `b`, observes a mismatched
    // networkId, classifies it `Unknown`, and the gate denies the op.
    let mut stream = b_fabric.dial(&a_peer, "dig/1", Duration::from_secs(2)).await.unwrap();
    stream
        .write_all(b"{\"type\":\"GET_STORE_CONTENT\",\"storeId\":\"store-x\"}\n")
        .await
        .unwrap();
    let line = read_line(&mut stream).await;
    let response: ErrorResponse = serde_json::from_str(line.lines().next().unwrap()).unwrap();
    assert_eq!(response.error, "peer-denied");
}

#[tokio::test]
async fn store_not_found_is_reported_for_a_verified_peer() {
    let network = Network::new();
    let (b_peer, _b_fabric, _b_dir) = spawn_node(&network, 34, "mainnet").await;
    let (_a_peer, a_fabric, _a_dir) = spawn_node(&network, 35, "mainnet").await;

    let mut stream = a_fabric.dial(&b_peer, "dig/1", Duration::from_secs(2)).await.unwrap();
    stream
        .write_all(b"{\"type\":\"GET_STORE_CONTENT\",\"storeId\":\"nope\"}\n")
        .await
        .unwrap();
    let line = read_line(&mut stream).await;
    let response: ErrorResponse = serde_json::from_str(line.lines().next().unwrap()).unwrap();
    assert_eq!(response.error, "store-not-found");
}

#[tokio::test]
async fn out_of_range_request_is_rejected_with_total_size() {
    let network = Network::new();
    let (b_peer, _b_fabric, b_dir) = spawn_node(&network, 36, "mainnet").await;
    seed_store(b_dir.path(), "store-y", b"12345").await;
    let (_a_peer, a_fabric, _a_dir) = spawn_node(&network, 37, "mainnet").await;

    let mut stream = a_fabric.dial(&b_peer, "dig/1", Duration::from_secs(2)).await.unwrap();
    stream
        .write_all(b"{\"type\":\"GET_FILE_RANGE\",\"storeId\":\"store-y\",\"rangeStart\":0,\"rangeEnd\":99}\n")
        .await
        .unwrap();
    let line = read_line(&mut stream).await;
    let response: ErrorResponse = serde_json::from_str(line.lines().next().unwrap()).unwrap();
    assert_eq!(response.error, "invalid-range");
    assert_eq!(response.total_size, Some(5));
}

#[tokio::test]
async fn verified_peer_reads_a_full_store_and_a_sub_range() {
    let network = Network::new();
    let (b_peer, _b_fabric, b_dir) = spawn_node(&network, 38, "mainnet").await;
    seed_store(b_dir.path(), "store-z", b"hello world").await;
    let (_a_peer, a_fabric, _a_dir) = spawn_node(&network, 39, "mainnet").await;

    let mut stream = a_fabric.dial(&b_peer, "dig/1", Duration::from_secs(2)).await.unwrap();
    stream
        .write_all(b"{\"type\":\"GET_STORE_CONTENT\",\"storeId\":\"store-z\"}\n")
        .await
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf[..n]).to_string();
    let mut lines = text.splitn(2, '\n');
    let header: StoreContentHeader = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert!(header.success);
    assert_eq!(header.size, 11);
    assert_eq!(lines.next().unwrap().as_bytes(), b"hello world");

    let mut stream = a_fabric.dial(&b_peer, "dig/1", Duration::from_secs(2)).await.unwrap();
    stream
        .write_all(b"{\"type\":\"GET_FILE_RANGE\",\"storeId\":\"store-z\",\"rangeStart\":6,\"rangeEnd\":10}\n")
        .await
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf[..n]).to_string();
    let mut lines = text.splitn(2, '\n');
    let header: FileRangeHeader = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert!(header.success);
    assert_eq!(header.size, 5);
    assert_eq!(lines.next().unwrap().as_bytes(), b"world");
}
