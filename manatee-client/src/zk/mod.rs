//! ZooKeeper session seam.
//!
//! The topology client is read-only with respect to the shard, so the seam
//! exposes exactly the read surface the watch protocol needs: data reads,
//! children listings, and existence checks, each with a one-shot watch
//! variant. One-shot watches are delivered as [`tokio::sync::oneshot`]
//! receivers; an armed watch fires at most once and the consumer re-arms by
//! issuing the next read.

/// Adapter over the `zookeeper-client` crate for real ensembles.
pub mod live;
/// In-process simulated ensemble for tests and local development.
pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::ZkConfig;

/// Errors returned by ZooKeeper reads.
#[derive(Debug, Clone, Error)]
pub enum ZkError {
    /// The node does not exist. A normal state for watched paths, never
    /// fatal.
    #[error("no node at {path}")]
    NoNode {
        /// Path of the absent node.
        path: String,
    },
    /// The session handle has been closed locally.
    #[error("zookeeper handle closed")]
    Closed,
    /// Any other failure; watchers retry these after a fixed delay.
    #[error("zookeeper operation failed: {0}")]
    Operation(String),
}

impl ZkError {
    /// True when the error denotes an absent node rather than a failure.
    #[must_use]
    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::NoNode { .. })
    }
}

/// The stat subset the watch protocol relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Data version; zero for a freshly created node.
    pub version: i32,
    /// Child-list version.
    pub cversion: i32,
}

/// What happened at a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    /// The node was created.
    NodeCreated,
    /// The node was deleted.
    NodeDeleted,
    /// The node's data changed.
    DataChanged,
    /// The node's child list changed.
    ChildrenChanged,
    /// Session-level notification forwarded to the watch.
    Session,
}

/// A fired one-shot watch.
#[derive(Debug, Clone)]
pub struct WatchedEvent {
    /// What happened.
    pub kind: WatchKind,
    /// Path the watch was armed on.
    pub path: String,
}

/// Receiving half of a one-shot watch; yields at most one event.
pub type NodeWatch = oneshot::Receiver<WatchedEvent>;

/// Session lifecycle notifications delivered outside the read path.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session established or re-established.
    Connected,
    /// Session attached to a read-only ensemble member.
    ConnectedReadOnly,
    /// Connection dropped; the session may still recover.
    Disconnected,
    /// Session expired; the handle is unusable and must be rebuilt.
    Expired,
    /// The ensemble rejected the session credentials.
    AuthFailed,
    /// Handle-level failure outside the normal session lifecycle.
    Faulted(String),
}

/// Read operations the topology client performs against an ensemble.
#[async_trait]
pub trait ZkOps: Send + Sync {
    /// Reads data and stat without arming a watch.
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat), ZkError>;

    /// Reads data and stat, arming a one-shot watch for the next change or
    /// deletion. Fails with [`ZkError::NoNode`] (and arms nothing) when the
    /// node is absent.
    async fn get_and_watch_data(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, NodeStat, NodeWatch), ZkError>;

    /// Checks existence, arming a one-shot watch that fires on creation,
    /// deletion, or a data change.
    async fn check_and_watch_stat(
        &self,
        path: &str,
    ) -> Result<(Option<NodeStat>, NodeWatch), ZkError>;

    /// Lists children, arming a one-shot watch for membership changes or
    /// deletion of the parent.
    async fn get_and_watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, NodeWatch), ZkError>;

    /// Terminates the session; subsequent reads fail with
    /// [`ZkError::Closed`].
    async fn close(&self);
}

/// An established session: a shared read handle plus its event stream.
pub struct ZkSession {
    /// Read operations bound to this session.
    pub ops: Arc<dyn ZkOps>,
    /// Session lifecycle events.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Factory for ZooKeeper sessions.
#[async_trait]
pub trait ZkBackend: Send + Sync + 'static {
    /// Establishes a session against the configured ensemble, resolving
    /// once the session reaches the connected state.
    async fn connect(&self, config: &ZkConfig) -> Result<ZkSession, ZkError>;
}
