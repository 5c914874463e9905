//! In-process simulated ensemble.
//!
//! Backs the test suites and local development with a single znode tree
//! that keeps real ZooKeeper semantics where the watch protocol depends on
//! them: data versions, per-parent ephemeral-sequential counters with
//! ten-digit suffixes, one-shot watches that fire on exactly the events the
//! wire protocol fires them for, and sessions that can be expired on
//! demand. Mutations (`create`, `set_data`, `delete`, `expire_sessions`)
//! are the test script's hands; the client under test only ever reads.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::{
    NodeStat, NodeWatch, SessionEvent, WatchKind, WatchedEvent, ZkBackend, ZkError, ZkOps,
    ZkSession,
};
use crate::config::ZkConfig;

/// Handle to a simulated ensemble, shared between the test script and every
/// session connected to it.
#[derive(Clone, Default)]
pub struct SimZk {
    state: Arc<Mutex<SimState>>,
}

#[derive(Default)]
struct SimState {
    nodes: HashMap<String, SimNode>,
    node_watches: HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
    child_watches: HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
    sessions: HashMap<u64, SimSession>,
    next_session: u64,
}

#[derive(Default)]
struct SimNode {
    data: Vec<u8>,
    version: i32,
    cversion: i32,
    children: BTreeSet<String>,
    next_sequence: u64,
}

impl SimNode {
    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            cversion: self.cversion,
        }
    }
}

struct SimSession {
    events: mpsc::UnboundedSender<SessionEvent>,
    alive: bool,
}

impl SimZk {
    /// Creates an empty ensemble.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a backend handle for connecting clients to this ensemble.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn ZkBackend> {
        Arc::new(self.clone())
    }

    /// Creates a node (and any missing ancestors) with the given payload.
    ///
    /// Upserts: an existing node has its data replaced instead, as if by
    /// [`set_data`](Self::set_data).
    pub fn create(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        Self::upsert(&mut state, path, data);
    }

    /// Replaces a node's payload, creating the node when absent.
    pub fn set_data(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        Self::upsert(&mut state, path, data);
    }

    /// Creates an ephemeral-sequential child under `parent`.
    ///
    /// ZooKeeper appends a ten-digit counter to whatever name the creator
    /// supplies, so election prefixes carry their trailing `-` themselves.
    /// Returns the full path of the created node.
    pub fn create_sequential(&self, parent: &str, prefix: &str, data: &[u8]) -> String {
        let mut state = self.state.lock();
        Self::ensure_node(&mut state, parent);
        let sequence = {
            let node = state.nodes.get_mut(parent).expect("parent just ensured");
            let sequence = node.next_sequence;
            node.next_sequence += 1;
            sequence
        };
        let path = format!("{parent}/{prefix}{sequence:010}");
        Self::upsert(&mut state, &path, data);
        path
    }

    /// Deletes a node if it exists.
    pub fn delete(&self, path: &str) {
        let mut state = self.state.lock();
        if state.nodes.remove(path).is_none() {
            return;
        }
        trace!(path, "sim node deleted");
        if let Some((parent, name)) = path.rsplit_once('/')
            && let Some(parent_node) = state.nodes.get_mut(parent)
        {
            parent_node.children.remove(name);
            parent_node.cversion += 1;
            Self::fire(&mut state.child_watches, parent, WatchKind::ChildrenChanged);
        }
        Self::fire(&mut state.node_watches, path, WatchKind::NodeDeleted);
        Self::fire(&mut state.child_watches, path, WatchKind::NodeDeleted);
    }

    /// Expires every live session, as a lost ensemble quorum would.
    pub fn expire_sessions(&self) {
        let mut state = self.state.lock();
        for session in state.sessions.values_mut() {
            if session.alive {
                session.alive = false;
                let _ = session.events.send(SessionEvent::Expired);
            }
        }
    }

    /// True when a node exists at `path`.
    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    fn upsert(state: &mut SimState, path: &str, data: &[u8]) {
        if let Some(node) = state.nodes.get_mut(path) {
            node.data = data.to_vec();
            node.version += 1;
            trace!(path, version = node.version, "sim node updated");
            Self::fire(&mut state.node_watches, path, WatchKind::DataChanged);
            return;
        }
        Self::ensure_node(state, path);
        let node = state.nodes.get_mut(path).expect("node just ensured");
        node.data = data.to_vec();
    }

    /// Creates `path` and any missing ancestors, firing creation watches.
    fn ensure_node(state: &mut SimState, path: &str) {
        let mut assembled = String::new();
        for component in path.split('/').filter(|component| !component.is_empty()) {
            let parent = assembled.clone();
            assembled.push('/');
            assembled.push_str(component);
            if state.nodes.contains_key(assembled.as_str()) {
                continue;
            }
            state.nodes.insert(assembled.clone(), SimNode::default());
            trace!(path = %assembled, "sim node created");
            if !parent.is_empty()
                && let Some(parent_node) = state.nodes.get_mut(parent.as_str())
            {
                parent_node.children.insert(component.to_string());
                parent_node.cversion += 1;
                Self::fire(&mut state.child_watches, &parent, WatchKind::ChildrenChanged);
            }
            Self::fire(&mut state.node_watches, &assembled, WatchKind::NodeCreated);
        }
    }

    fn fire(
        watches: &mut HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
        path: &str,
        kind: WatchKind,
    ) {
        let Some(armed) = watches.remove(path) else {
            return;
        };
        for watch in armed {
            let _ = watch.send(WatchedEvent {
                kind,
                path: path.to_string(),
            });
        }
    }
}

#[async_trait]
impl ZkBackend for SimZk {
    async fn connect(&self, _config: &ZkConfig) -> Result<ZkSession, ZkError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let session = {
            let mut state = self.state.lock();
            let session = state.next_session;
            state.next_session += 1;
            state.sessions.insert(
                session,
                SimSession {
                    events: events_tx.clone(),
                    alive: true,
                },
            );
            session
        };
        let _ = events_tx.send(SessionEvent::Connected);
        Ok(ZkSession {
            ops: Arc::new(SimOps {
                sim: self.clone(),
                session,
            }),
            events,
        })
    }
}

struct SimOps {
    sim: SimZk,
    session: u64,
}

impl SimOps {
    fn check_alive(&self, state: &SimState) -> Result<(), ZkError> {
        match state.sessions.get(&self.session) {
            Some(session) if session.alive => Ok(()),
            _ => Err(ZkError::Closed),
        }
    }

    fn arm(
        watches: &mut HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
        path: &str,
    ) -> NodeWatch {
        let (tx, rx) = oneshot::channel();
        watches.entry(path.to_string()).or_default().push(tx);
        rx
    }
}

#[async_trait]
impl ZkOps for SimOps {
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat), ZkError> {
        let state = self.sim.state.lock();
        self.check_alive(&state)?;
        match state.nodes.get(path) {
            Some(node) => Ok((node.data.clone(), node.stat())),
            None => Err(ZkError::NoNode {
                path: path.to_string(),
            }),
        }
    }

    async fn get_and_watch_data(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, NodeStat, NodeWatch), ZkError> {
        let mut state = self.sim.state.lock();
        self.check_alive(&state)?;
        let Some(node) = state.nodes.get(path) else {
            return Err(ZkError::NoNode {
                path: path.to_string(),
            });
        };
        let (data, stat) = (node.data.clone(), node.stat());
        let watch = Self::arm(&mut state.node_watches, path);
        Ok((data, stat, watch))
    }

    async fn check_and_watch_stat(
        &self,
        path: &str,
    ) -> Result<(Option<NodeStat>, NodeWatch), ZkError> {
        let mut state = self.sim.state.lock();
        self.check_alive(&state)?;
        let stat = state.nodes.get(path).map(SimNode::stat);
        let watch = Self::arm(&mut state.node_watches, path);
        Ok((stat, watch))
    }

    async fn get_and_watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, NodeWatch), ZkError> {
        let mut state = self.sim.state.lock();
        self.check_alive(&state)?;
        let Some(node) = state.nodes.get(path) else {
            return Err(ZkError::NoNode {
                path: path.to_string(),
            });
        };
        let children = node.children.iter().cloned().collect();
        let watch = Self::arm(&mut state.child_watches, path);
        Ok((children, watch))
    }

    async fn close(&self) {
        let mut state = self.sim.state.lock();
        if let Some(session) = state.sessions.get_mut(&self.session) {
            session.alive = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(sim: &SimZk) -> ZkSession {
        sim.backend()
            .connect(&ZkConfig::default())
            .await
            .expect("sim connect")
    }

    #[tokio::test]
    async fn sequential_names_carry_ten_digit_counters() {
        let sim = SimZk::new();
        let first = sim.create_sequential("/shard/election", "10.0.0.1:5432:12345-", b"");
        let second = sim.create_sequential("/shard/election", "10.0.0.2:5432:12345-", b"");
        assert_eq!(first, "/shard/election/10.0.0.1:5432:12345-0000000000");
        assert_eq!(second, "/shard/election/10.0.0.2:5432:12345-0000000001");
    }

    #[tokio::test]
    async fn data_watch_fires_once_per_arming() {
        let sim = SimZk::new();
        sim.create("/node", b"a");
        let session = session(&sim).await;

        let (_, _, watch) = session
            .ops
            .get_and_watch_data("/node")
            .await
            .expect("read with watch");
        sim.set_data("/node", b"b");
        let event = watch.await.expect("watch fires");
        assert_eq!(event.kind, WatchKind::DataChanged);

        // The second mutation finds no armed watch; re-arming sees version 2.
        sim.set_data("/node", b"c");
        let (data, stat, _) = session
            .ops
            .get_and_watch_data("/node")
            .await
            .expect("re-read");
        assert_eq!(data, b"c");
        assert_eq!(stat.version, 2);
    }

    #[tokio::test]
    async fn exists_watch_fires_on_creation() {
        let sim = SimZk::new();
        let session = session(&sim).await;
        let (stat, watch) = session
            .ops
            .check_and_watch_stat("/later")
            .await
            .expect("exists check");
        assert!(stat.is_none());
        sim.create("/later", b"");
        assert_eq!(watch.await.expect("watch fires").kind, WatchKind::NodeCreated);
    }

    #[tokio::test]
    async fn child_watch_fires_on_membership_change_and_parent_delete() {
        let sim = SimZk::new();
        sim.create("/dir", b"");
        let session = session(&sim).await;

        let (children, watch) = session
            .ops
            .get_and_watch_children("/dir")
            .await
            .expect("list");
        assert!(children.is_empty());
        sim.create("/dir/a", b"");
        assert_eq!(
            watch.await.expect("watch fires").kind,
            WatchKind::ChildrenChanged
        );

        let (children, watch) = session
            .ops
            .get_and_watch_children("/dir")
            .await
            .expect("list");
        assert_eq!(children, vec!["a".to_string()]);
        sim.delete("/dir");
        assert_eq!(watch.await.expect("watch fires").kind, WatchKind::NodeDeleted);
    }

    #[tokio::test]
    async fn expired_sessions_refuse_reads() {
        let sim = SimZk::new();
        sim.create("/node", b"");
        let mut session = session(&sim).await;
        assert!(matches!(
            session.events.recv().await,
            Some(SessionEvent::Connected)
        ));

        sim.expire_sessions();
        assert!(matches!(
            session.events.recv().await,
            Some(SessionEvent::Expired)
        ));
        assert!(matches!(
            session.ops.get_data("/node").await,
            Err(ZkError::Closed)
        ));
    }
}
