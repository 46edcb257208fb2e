//! Resume-after-interruption and relay-fallback scenarios: a partially
//! completed download picked back up from its persisted sidecar, and a
//! store fetched through a relay when the source is known but not
//! directly connected.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dig_core::node::downloader::Downloader;
use dig_core::node::registry::Classification;
use dig_core::node::DirectTransport;
use dig_core::node::relay::RelayCoordinator;
use dig_core::node::session::{scan_resumable, Session, Source};
use dig_core::Node;
use dig_discovery::RelayCandidate;
use dig_tests::{seed_store, test_config, ClientHarness, Network};
use tempfile::TempDir;

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

#[tokio::test]
async fn interrupted_download_resumes_from_persisted_state() {
    let network = Network::new();
    let store_id = "resumable-store";
    let payload: Vec<u8> = (0..600_000u32).map(|i| (i % 223) as u8).collect();

    let server_dir = TempDir::new().unwrap();
    seed_store(server_dir.path(), store_id, &payload).await;
    let server_config = test_config(server_dir.path(), 10);
    let server = Arc::new(Node::new(server_config).unwrap());
    let server_peer = server.local_peer_id().clone();
    network.join(server);

    let client_dir = TempDir::new().unwrap();
    let client_fabric = network.fabric_for("resumer".to_string());

    let relay = Arc::new(RelayCoordinator::new(
        "resumer".to_string(),
        Duration::from_secs(2),
        Duration::from_secs(2),
    ));
    let downloader = Downloader::new(
        relay,
        Duration::from_secs(2),
        Duration::from_secs(2),
        Duration::from_secs(2),
        3,
    );

    let mut session = Session::new(
        client_dir.path(),
        store_id,
        payload.len() as u64,
        262_144,
        4,
        vec![Source::direct(server_peer.clone(), 0)],
    );

    // Cancel immediately: the downloader should still persist whatever
    // progress it made (none, here, but the sidecar and temp file land on
    // disk) before returning `Cancelled`.
    let cancel = Arc::new(AtomicBool::new(true));
    let err = downloader
        .run(client_fabric.clone(), &mut session, cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, dig_core::NodeError::Cancelled(_)));
    assert!(!session.is_complete());

    let resumable = scan_resumable(client_dir.path()).await.unwrap();
    assert_eq!(resumable.len(), 1);
    let mut resumed = resumable.into_iter().next().unwrap();
    assert_eq!(resumed.store_id, store_id);
    assert_eq!(resumed.status, dig_core::node::session::SessionStatus::Paused);

    let relay = Arc::new(RelayCoordinator::new(
        "resumer".to_string(),
        Duration::from_secs(2),
        Duration::from_secs(2),
    ));
    let downloader = Downloader::new(
        relay,
        Duration::from_secs(2),
        Duration::from_secs(2),
        Duration::from_secs(2),
        3,
    );
    let cancel = Arc::new(AtomicBool::new(false));
    let final_path = downloader
        .run(client_fabric, &mut resumed, cancel)
        .await
        .unwrap();

    let written = tokio::fs::read(&final_path).await.unwrap();
    assert_eq!(written, payload);
    assert!(scan_resumable(client_dir.path()).await.unwrap().is_empty());
}

#[tokio::test]
async fn download_falls_back_to_relay_when_source_is_not_directly_connected() {
    let network = Network::new();
    let store_id = "relayed-store";
    let payload = b"reached only through the relay".to_vec();

    let source_dir = TempDir::new().unwrap();
    seed_store(source_dir.path(), store_id, &payload).await;
    let source_config = test_config(source_dir.path(), 20);
    let source = Arc::new(Node::new(source_config).unwrap());
    let source_peer = source.local_peer_id().clone();
    network.join(source);

    let relay_dir = TempDir::new().unwrap();
    let relay_config = test_config(relay_dir.path(), 21);
    let relay_node = Arc::new(Node::new(relay_config).unwrap());
    let relay_peer = relay_node.local_peer_id().clone();
    let relay_fabric = network.join(relay_node.clone());
    // Recomputes the capability profile so `can_act_as_relay` flips on
    // (the in-memory fabric's "mem://" address is never loopback/private).
    relay_node.start(relay_fabric.clone()).await.unwrap();

    let client_dir = TempDir::new().unwrap();
    let client = ClientHarness::new(&network, "relay-client".to_string(), client_dir.path());

    // Classify the source through a throwaway fabric identity so the
    // registry learns its advertised stores without the client's own
    // fabric recording a direct connection to it.
    let classification = client.classify_via_shadow("relay-client-shadow".to_string(), source_peer.clone()).await;
    assert_eq!(classification, Classification::VerifiedOverlay);
    assert!(!client.fabric.is_connected(&source_peer));

    client
        .relay
        .upsert(RelayCandidate {
            peer_id: relay_peer.clone(),
            addresses: relay_fabric.local_addresses(),
            current_load: 0,
            max_capacity: 10,
            last_seen_healthy: unix_now(),
        })
        .await;

    let outcome = client.download(store_id).await;
    assert!(outcome.success, "download failed: {:?}", outcome.error);
    assert_eq!(outcome.strategy, Some(dig_core::node::orchestrator::Strategy::RelayViaCandidate));

    let final_path = outcome.final_path.unwrap();
    let written = tokio::fs::read(&final_path).await.unwrap();
    assert_eq!(written, payload);

    relay_node.shutdown().await;
}
