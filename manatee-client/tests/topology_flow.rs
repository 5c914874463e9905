#![allow(missing_docs)]

//! End-to-end topology scenarios driven through the simulated ensemble.

use std::time::Duration;

use manatee_client::zk::sim::SimZk;
use manatee_client::{ClientConfig, PeerUrl, ShardClient, ShardEvent};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const SHARD: &str = "/manatee/1.moray.coal.joyent.us";

fn config() -> ClientConfig {
    ClientConfig::new(SHARD, "zk1:2181,zk2:2181,zk3:2181")
}

fn election() -> String {
    format!("{SHARD}/election")
}

fn state() -> String {
    format!("{SHARD}/state")
}

fn u(host: &str) -> PeerUrl {
    PeerUrl::new(format!("tcp://{host}:5432"))
}

fn id(host: &str) -> String {
    format!("{host}:5432:12345-")
}

async fn recv_event(events: &mut broadcast::Receiver<ShardEvent>) -> ShardEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within deadline")
        .expect("event stream open")
}

async fn recv_topology(events: &mut broadcast::Receiver<ShardEvent>) -> Vec<PeerUrl> {
    match recv_event(events).await {
        ShardEvent::Topology(urls) => urls,
        other => panic!("expected topology, got {other:?}"),
    }
}

/// Lets in-flight watch deliveries drain before the script moves on.
async fn settle() {
    sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn ready_precedes_first_topology_and_empty_shard_is_empty() {
    let sim = SimZk::new();
    sim.create(&election(), b"");
    let client = ShardClient::spawn(config(), sim.backend());
    let mut events = client.subscribe();

    assert!(matches!(recv_event(&mut events).await, ShardEvent::Ready));
    assert_eq!(recv_topology(&mut events).await, Vec::<PeerUrl>::new());

    client.close();
    assert!(matches!(recv_event(&mut events).await, ShardEvent::Close));
    client.wait().await;
}

#[tokio::test]
async fn election_order_follows_sequence_numbers() {
    let sim = SimZk::new();
    sim.create(&election(), b"");
    let client = ShardClient::spawn(config(), sim.backend());
    let mut events = client.subscribe();
    assert!(matches!(recv_event(&mut events).await, ShardEvent::Ready));
    assert!(recv_topology(&mut events).await.is_empty());

    let first = sim.create_sequential(&election(), &id("19.19.19.19"), b"");
    assert_eq!(recv_topology(&mut events).await, vec![u("19.19.19.19")]);

    sim.create_sequential(&election(), &id("20.20.20.20"), b"");
    assert_eq!(
        recv_topology(&mut events).await,
        vec![u("19.19.19.19"), u("20.20.20.20")]
    );

    sim.delete(&first);
    assert_eq!(recv_topology(&mut events).await, vec![u("20.20.20.20")]);

    client.close();
}

#[tokio::test]
async fn cluster_state_wins_and_its_deletion_reverts_to_actives() {
    let sim = SimZk::new();
    sim.create(&election(), b"");
    let first = sim.create_sequential(&election(), &id("19.19.19.19"), b"");
    sim.create_sequential(&election(), &id("20.20.20.20"), b"");

    let client = ShardClient::spawn(config(), sim.backend());
    let mut events = client.subscribe();
    assert!(matches!(recv_event(&mut events).await, ShardEvent::Ready));
    assert_eq!(
        recv_topology(&mut events).await,
        vec![u("19.19.19.19"), u("20.20.20.20")]
    );

    let document = serde_json::json!({
        "generation": 1,
        "primary": {"pgUrl": "tcp://1.1.1.1:5432"},
        "sync": {"pgUrl": "tcp://2.2.2.2:5432"},
        "async": [{"pgUrl": "tcp://3.3.3.3:5432"}],
    });
    sim.create(&state(), document.to_string().as_bytes());
    assert_eq!(
        recv_topology(&mut events).await,
        vec![u("1.1.1.1"), u("2.2.2.2"), u("3.3.3.3")]
    );

    // While the state node exists, election churn must be silent.
    sim.create_sequential(&election(), &id("21.21.21.21"), b"");
    sim.delete(&first);
    settle().await;

    // Deleting the state node produces exactly one emission, computed from
    // the current election membership.
    sim.delete(&state());
    assert_eq!(
        recv_topology(&mut events).await,
        vec![u("20.20.20.20"), u("21.21.21.21")]
    );

    client.close();
}

#[tokio::test]
async fn cluster_state_updates_are_debounced() {
    let sim = SimZk::new();
    let document = serde_json::json!({
        "primary": {"pgUrl": "tcp://1.1.1.1:5432"},
    });
    sim.create(&state(), document.to_string().as_bytes());

    let client = ShardClient::spawn(config(), sim.backend());
    let mut events = client.subscribe();
    assert!(matches!(recv_event(&mut events).await, ShardEvent::Ready));
    assert_eq!(recv_topology(&mut events).await, vec![u("1.1.1.1")]);

    // Same ordering, different document bytes: no emission.
    let same = serde_json::json!({
        "generation": 7,
        "primary": {"pgUrl": "tcp://1.1.1.1:5432"},
    });
    sim.set_data(&state(), same.to_string().as_bytes());
    settle().await;

    let changed = serde_json::json!({
        "primary": {"pgUrl": "tcp://9.9.9.9:5432"},
    });
    sim.set_data(&state(), changed.to_string().as_bytes());
    assert_eq!(recv_topology(&mut events).await, vec![u("9.9.9.9")]);

    client.close();
}

#[tokio::test]
async fn session_expiry_drops_no_updates() {
    let sim = SimZk::new();
    sim.create(&election(), b"");
    sim.create_sequential(&election(), &id("19.19.19.19"), b"");

    let client = ShardClient::spawn(config(), sim.backend());
    let mut events = client.subscribe();
    assert!(matches!(recv_event(&mut events).await, ShardEvent::Ready));
    assert_eq!(recv_topology(&mut events).await, vec![u("19.19.19.19")]);

    sim.expire_sessions();
    sim.create_sequential(&election(), &id("20.20.20.20"), b"");

    // The rebuilt session re-reads the final contents; ready is sticky, so
    // the next event is the topology itself.
    assert_eq!(
        recv_topology(&mut events).await,
        vec![u("19.19.19.19"), u("20.20.20.20")]
    );

    client.close();
}

#[tokio::test]
async fn malformed_cluster_state_surfaces_one_error() {
    let sim = SimZk::new();
    let document = serde_json::json!({
        "primary": {"pgUrl": "tcp://1.1.1.1:5432"},
    });
    sim.create(&state(), document.to_string().as_bytes());

    let client = ShardClient::spawn(config(), sim.backend());
    let mut events = client.subscribe();
    assert!(matches!(recv_event(&mut events).await, ShardEvent::Ready));
    assert_eq!(recv_topology(&mut events).await, vec![u("1.1.1.1")]);

    sim.set_data(&state(), b"{not json");
    assert!(matches!(
        recv_event(&mut events).await,
        ShardEvent::Error(_)
    ));

    // The bad payload mutated nothing: the last good document still wins,
    // so election churn stays silent.
    sim.create(&election(), b"");
    sim.create_sequential(&election(), &id("5.5.5.5"), b"");
    settle().await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    client.close();
}
