#![allow(missing_docs)]

//! Primary-resolver scenarios driven through the simulated ensemble.

use std::net::IpAddr;
use std::time::Duration;

use manatee_client::zk::sim::SimZk;
use manatee_client::{
    ClientConfig, ClientError, PrimaryResolver, ResolverEvent, ResolverState,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

const SHARD: &str = "/manatee/1.moray.coal.joyent.us";

fn config() -> ClientConfig {
    ClientConfig::new(SHARD, "zk1:2181")
}

fn state() -> String {
    format!("{SHARD}/state")
}

fn address(s: &str) -> IpAddr {
    s.parse().expect("literal address")
}

fn state_with_primary(host: &str) -> Vec<u8> {
    serde_json::json!({
        "primary": {"pgUrl": format!("tcp://{host}:5432")},
        "sync": {"pgUrl": "tcp://2.2.2.2:5432"},
        "async": [{"pgUrl": "tcp://3.3.3.3:5432"}],
    })
    .to_string()
    .into_bytes()
}

async fn recv_event(events: &mut broadcast::Receiver<ResolverEvent>) -> ResolverEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within deadline")
        .expect("event stream open")
}

#[tokio::test]
async fn tracks_primary_with_rotating_keys() {
    let sim = SimZk::new();
    sim.create(&state(), &state_with_primary("1.1.1.1"));

    let resolver = PrimaryResolver::new(config(), sim.backend());
    let mut events = resolver.subscribe();
    resolver.start();

    let ResolverEvent::Added { key: k1, record } = recv_event(&mut events).await else {
        panic!("expected added");
    };
    assert_eq!(record.name, "primary");
    assert_eq!(record.address, address("1.1.1.1"));
    assert_eq!(record.port, 5432);
    assert_eq!(k1.len(), 12);
    assert_eq!(resolver.count(), 1);
    assert!(resolver.list().contains_key(&k1));
    assert_eq!(resolver.state(), ResolverState::Running);

    // A new primary mints a new key; the old key retires after the add.
    sim.set_data(&state(), &state_with_primary("9.9.9.9"));
    let ResolverEvent::Added { key: k2, record } = recv_event(&mut events).await else {
        panic!("expected added for the successor");
    };
    assert_eq!(record.address, address("9.9.9.9"));
    assert_eq!(record.port, 5432);
    assert_eq!(k2.len(), 12);
    assert_ne!(k1, k2, "keys are never reused");
    let ResolverEvent::Removed { key } = recv_event(&mut events).await else {
        panic!("expected removed after added");
    };
    assert_eq!(key, k1);

    resolver.stop().await;
    assert_eq!(resolver.state(), ResolverState::Stopped);
}

#[tokio::test]
async fn unchanged_primary_is_ignored() {
    let sim = SimZk::new();
    sim.create(&state(), &state_with_primary("1.1.1.1"));

    let resolver = PrimaryResolver::new(config(), sim.backend());
    let mut events = resolver.subscribe();
    resolver.start();

    let ResolverEvent::Added { key, .. } = recv_event(&mut events).await else {
        panic!("expected added");
    };

    // Same primary, topology differs only in standbys: no events.
    sim.set_data(
        &state(),
        serde_json::json!({
            "primary": {"pgUrl": "tcp://1.1.1.1:5432"},
            "sync": {"pgUrl": "tcp://4.4.4.4:5432"},
        })
        .to_string()
        .as_bytes(),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(resolver.list().len(), 1);
    assert!(resolver.list().contains_key(&key));

    resolver.stop().await;
}

#[tokio::test]
async fn hostname_primary_fails_the_resolver_then_recovers() {
    let sim = SimZk::new();
    sim.create(
        &state(),
        serde_json::json!({
            "primary": {"pgUrl": "tcp://db.example.com:5432"},
        })
        .to_string()
        .as_bytes(),
    );

    let resolver = PrimaryResolver::new(config(), sim.backend());
    let mut events = resolver.subscribe();
    resolver.start();

    // The contract violation parks the resolver in failed.
    timeout(Duration::from_secs(5), async {
        while resolver.state() != ResolverState::Failed {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("resolver reaches failed");
    assert!(matches!(
        resolver.last_error(),
        Some(ClientError::MalformedPrimaryUrl(_))
    ));
    assert_eq!(resolver.count(), 0);

    // Repairing the document lets the one-second restart succeed.
    sim.set_data(&state(), &state_with_primary("1.1.1.1"));
    let ResolverEvent::Added { record, .. } = recv_event(&mut events).await else {
        panic!("expected added after recovery");
    };
    assert_eq!(record.address, address("1.1.1.1"));
    assert_eq!(resolver.state(), ResolverState::Running);

    resolver.stop().await;
    assert_eq!(resolver.state(), ResolverState::Stopped);
}
