//! Live ensemble adapter over the `zookeeper-client` crate.
//!
//! Thin glue: reads map one-to-one onto the crate's watch-variant calls,
//! the crate's oneshot watchers are bridged into the seam's receivers by
//! small forwarder tasks, and the session-state watcher is relayed into
//! [`SessionEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use zookeeper_client as zk;

use super::{
    NodeStat, NodeWatch, SessionEvent, WatchKind, WatchedEvent, ZkBackend, ZkError, ZkOps,
    ZkSession,
};
use crate::config::ZkConfig;

/// Backend producing sessions against a real ZooKeeper ensemble.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveZk;

impl LiveZk {
    /// Creates the live backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ZkBackend for LiveZk {
    async fn connect(&self, config: &ZkConfig) -> Result<ZkSession, ZkError> {
        let mut connector = zk::Client::connector();
        connector.session_timeout(config.session_timeout);
        let client = connector
            .connect(&config.conn_str)
            .await
            .map_err(|err| ZkError::Operation(err.to_string()))?;
        debug!(ensemble = %config.conn_str, "zookeeper session established");

        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(relay_session_states(client.state_watcher(), events_tx));
        Ok(ZkSession {
            ops: Arc::new(LiveOps {
                client: Mutex::new(Some(client)),
            }),
            events,
        })
    }
}

async fn relay_session_states(
    mut states: zk::StateWatcher,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        let state = states.changed().await;
        let event = match state {
            zk::SessionState::SyncConnected => SessionEvent::Connected,
            zk::SessionState::ConnectedReadOnly => SessionEvent::ConnectedReadOnly,
            zk::SessionState::Disconnected => SessionEvent::Disconnected,
            zk::SessionState::AuthFailed => SessionEvent::AuthFailed,
            zk::SessionState::Expired => SessionEvent::Expired,
            other => SessionEvent::Faulted(format!("{other:?}")),
        };
        let terminated = state.is_terminated();
        if events.send(event).is_err() || terminated {
            return;
        }
    }
}

struct LiveOps {
    client: Mutex<Option<zk::Client>>,
}

impl LiveOps {
    fn client(&self) -> Result<zk::Client, ZkError> {
        self.client.lock().clone().ok_or(ZkError::Closed)
    }
}

fn map_err(path: &str, err: zk::Error) -> ZkError {
    match err {
        zk::Error::NoNode => ZkError::NoNode {
            path: path.to_string(),
        },
        other => ZkError::Operation(other.to_string()),
    }
}

fn map_stat(stat: &zk::Stat) -> NodeStat {
    NodeStat {
        version: stat.version,
        cversion: stat.cversion,
    }
}

/// Bridges a crate oneshot watcher into the seam's receiver.
fn bridge_watch(watcher: zk::OneshotWatcher) -> NodeWatch {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let event = watcher.changed().await;
        let kind = match event.event_type {
            zk::EventType::NodeCreated => WatchKind::NodeCreated,
            zk::EventType::NodeDeleted => WatchKind::NodeDeleted,
            zk::EventType::NodeDataChanged => WatchKind::DataChanged,
            zk::EventType::NodeChildrenChanged => WatchKind::ChildrenChanged,
            _ => WatchKind::Session,
        };
        let _ = tx.send(WatchedEvent {
            kind,
            path: event.path,
        });
    });
    rx
}

#[async_trait]
impl ZkOps for LiveOps {
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat), ZkError> {
        let client = self.client()?;
        let (data, stat) = client
            .get_data(path)
            .await
            .map_err(|err| map_err(path, err))?;
        Ok((data, map_stat(&stat)))
    }

    async fn get_and_watch_data(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, NodeStat, NodeWatch), ZkError> {
        let client = self.client()?;
        let (data, stat, watcher) = client
            .get_and_watch_data(path)
            .await
            .map_err(|err| map_err(path, err))?;
        Ok((data, map_stat(&stat), bridge_watch(watcher)))
    }

    async fn check_and_watch_stat(
        &self,
        path: &str,
    ) -> Result<(Option<NodeStat>, NodeWatch), ZkError> {
        let client = self.client()?;
        let (stat, watcher) = client
            .check_and_watch_stat(path)
            .await
            .map_err(|err| map_err(path, err))?;
        Ok((stat.as_ref().map(map_stat), bridge_watch(watcher)))
    }

    async fn get_and_watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, NodeWatch), ZkError> {
        let client = self.client()?;
        let (children, watcher) = client
            .list_and_watch_children(path)
            .await
            .map_err(|err| map_err(path, err))?;
        Ok((children, bridge_watch(watcher)))
    }

    async fn close(&self) {
        // The session terminates when the last handle drops.
        let client = self.client.lock().take();
        drop(client);
        debug!("zookeeper handle released");
    }
}
