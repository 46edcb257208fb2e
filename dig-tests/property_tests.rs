//! Properties not already exercised by `dig-core`'s own unit tests:
//! chunk-range partitioning across arbitrary store/chunk sizes, and
//! whole-store round-tripping through the real download pipeline for
//! arbitrary content.

use std::path::Path;
use std::sync::Arc;

use dig_core::node::session::{Session, Source};
use dig_core::{Node, NodeConfig};
use dig_tests::{seed_store, test_config, ClientHarness, Network};
use proptest::prelude::*;
use tempfile::TempDir;

fn chunk_session(total_size: u64, chunk_size: u64) -> Session {
    Session::new(
        Path::new("/tmp/dig-tests-property"),
        "prop-store",
        total_size,
        chunk_size,
        4,
        vec![Source::direct("peer-a", 0)],
    )
}

proptest! {
    /// Every chunk range is non-empty, ranges are contiguous and disjoint,
    /// and the final chunk's end is exactly `total_size - 1` — property 10
    /// (zero-size store has zero chunks) and its siblings, for arbitrary
    /// sizes rather than the unit tests' hand-picked boundary cases.
    #[test]
    fn chunk_ranges_partition_the_store_exactly(
        total_size in 0u64..8_000_000,
        chunk_size in 1u64..2_000_000,
    ) {
        let session = chunk_session(total_size, chunk_size);

        if total_size == 0 {
            prop_assert_eq!(session.total_chunks(), 0);
            return Ok(());
        }

        let mut expected_start = 0u64;
        for i in 0..session.total_chunks() {
            let (start, end) = session.chunk_range(i);
            prop_assert_eq!(start, expected_start);
            prop_assert!(end >= start);
            expected_start = end + 1;
        }
        prop_assert_eq!(expected_start, total_size);
    }

    /// `pick_source` always returns an index into `sources` as long as at
    /// least one source has not hit the failure threshold.
    #[test]
    fn pick_source_never_returns_an_exhausted_index(
        failures_a in 0u32..5,
        failures_b in 0u32..5,
        threshold in 1u32..5,
    ) {
        let mut session = chunk_session(1024, 256);
        session.sources.push(Source::direct("peer-b", 1));
        session.sources[0].failures = failures_a;
        session.sources[1].failures = failures_b;

        match session.pick_source(0, 0, threshold) {
            Ok(idx) => prop_assert!(!session.sources[idx].is_exhausted(threshold)),
            Err(_) => prop_assert!(session.sources.iter().all(|s| s.is_exhausted(threshold))),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Arbitrary store content downloaded end to end through a real
    /// `Node`/`ClientHarness` pair comes back byte-for-byte identical,
    /// regardless of how many chunk boundaries it crosses.
    #[test]
    fn arbitrary_store_content_round_trips(payload in proptest::collection::vec(any::<u8>(), 0..6000)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let network = Network::new();
            let store_id = "prop-round-trip";

            let server_dir = TempDir::new().unwrap();
            seed_store(server_dir.path(), store_id, &payload).await;
            let config: NodeConfig = test_config(server_dir.path(), 99);
            let server = Arc::new(Node::new(config).unwrap());
            let server_peer = server.local_peer_id().clone();
            network.join(server);

            let client_dir = TempDir::new().unwrap();
            let client = ClientHarness::new(&network, "prop-client".to_string(), client_dir.path());
            client.classify(server_peer).await;

            let outcome = client.download(store_id).await;
            assert!(outcome.success, "download failed: {:?}", outcome.error);
            let final_path = outcome.final_path.unwrap();
            let written = tokio::fs::read(&final_path).await.unwrap();
            assert_eq!(written, payload);
        });
    }
}
