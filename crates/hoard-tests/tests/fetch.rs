//! On-demand fetch tests.
//!
//! A node missing a file asks its peers and streams it back from whichever
//! one has it.

use std::time::{Duration, Instant};

use hoard_core::SecretKey;
use hoard_server::ServerError;
use hoard_tests::{TestNetwork, TestNode, TestNodeConfig};

const WAIT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hoard_tests=debug,hoard_server=debug")
        .with_test_writer()
        .try_init();
}

fn is_not_found(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    matches!(err.downcast_ref::<ServerError>(), Some(ServerError::NotFound(_)))
}

#[tokio::test]
async fn test_get_without_peers() {
    init_tracing();

    let node = TestNode::start(TestNodeConfig::default()).await.unwrap();

    let start = Instant::now();
    let err = node.get_bytes("never-stored").await.unwrap_err();
    assert!(is_not_found(err.as_ref()), "unexpected error: {}", err);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_delete_then_fetch_from_network() {
    init_tracing();

    let network = TestNetwork::with_nodes(2).await.unwrap();
    network.connect_mesh().await.unwrap();
    let a = network.node(0).unwrap();
    let b = network.node(1).unwrap();

    let data = b"my big data file here!";
    b.store("myprivatedata", data).await.unwrap();
    a.wait_for_contents("myprivatedata", data, WAIT).await.unwrap();

    b.server.delete_local("myprivatedata").await.unwrap();
    assert!(!b.has_local("myprivatedata").await);

    assert_eq!(b.get_bytes("myprivatedata").await.unwrap(), data);
    assert!(b.has_local("myprivatedata").await);
}

#[tokio::test]
async fn test_fetch_file_stored_before_connecting() {
    init_tracing();

    let network = TestNetwork::with_nodes(2).await.unwrap();
    let a = network.node(0).unwrap();
    let b = network.node(1).unwrap();

    // No peers yet, so nothing is replicated.
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
    a.store("archive.tar", &data).await.unwrap();

    network.connect_mesh().await.unwrap();
    assert!(!b.has_local("archive.tar").await);

    assert_eq!(b.get_bytes("archive.tar").await.unwrap(), data);
}

#[tokio::test]
async fn test_missing_everywhere_answers_before_timeout() {
    init_tracing();

    let network = TestNetwork::with_nodes(3).await.unwrap();
    network.connect_mesh().await.unwrap();
    let node = network.node(0).unwrap();

    let start = Instant::now();
    let err = node.get_bytes("nobody-has-this").await.unwrap_err();
    assert!(is_not_found(err.as_ref()), "unexpected error: {}", err);

    // Every peer answered NotFound, so the response timeout never ran out.
    assert!(start.elapsed() < TestNodeConfig::default().response_timeout);
}

#[tokio::test]
async fn test_one_of_many_peers_serves() {
    init_tracing();

    let network = TestNetwork::with_nodes(4).await.unwrap();
    let holder = network.node(3).unwrap();
    holder.store("rare", b"only here").await.unwrap();

    network.connect_mesh().await.unwrap();

    let asker = network.node(0).unwrap();
    assert_eq!(asker.get_bytes("rare").await.unwrap(), b"only here");
    assert!(!network.node(1).unwrap().has_local("rare").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_several_holders_answer_one_get() {
    init_tracing();

    let network = TestNetwork::with_nodes(3).await.unwrap();
    let data: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
    network.node(1).unwrap().store("k", &data).await.unwrap();
    network.node(2).unwrap().store("k", &data).await.unwrap();
    network.connect_mesh().await.unwrap();

    let asker = network.node(0).unwrap();
    for round in 0..10 {
        let got = asker.get_bytes("k").await.unwrap();
        assert_eq!(got.len(), data.len(), "round {}", round);
        assert!(got == data, "round {}: contents differ", round);
        asker.server.delete_local("k").await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_holder_reachable_over_two_connections() {
    init_tracing();

    let network = TestNetwork::with_nodes(2).await.unwrap();
    let a = network.node(0).unwrap();
    let b = network.node(1).unwrap();

    let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 199) as u8).collect();
    b.store("twice", &data).await.unwrap();

    // Each side dials the other, so each holds two connections.
    a.connect_to(b).await.unwrap();
    b.connect_to(a).await.unwrap();
    a.wait_for_peers(2, WAIT).await.unwrap();
    b.wait_for_peers(2, WAIT).await.unwrap();

    for round in 0..5 {
        let got = a.get_bytes("twice").await.unwrap();
        assert!(got == data, "round {}: got {} bytes", round, got.len());
        a.server.delete_local("twice").await.unwrap();
    }
}

#[tokio::test]
async fn test_different_secrets_do_not_decrypt() {
    init_tracing();

    let a = TestNode::start(TestNodeConfig::default()).await.unwrap();
    let b = TestNode::start(TestNodeConfig {
        secret: SecretKey::random(),
        ..Default::default()
    })
    .await
    .unwrap();
    b.connect_to(&a).await.unwrap();
    a.wait_for_peers(1, WAIT).await.unwrap();

    let data = b"readable only with the right secret";
    b.store("k", data).await.unwrap();
    a.wait_for_file("k", WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received = a.get_bytes("k").await.unwrap();
    assert_eq!(received.len(), data.len());
    assert_ne!(received, data);
}
