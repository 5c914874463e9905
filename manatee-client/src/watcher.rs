//! Per-path view maintenance over one-shot ZooKeeper watches.
//!
//! ZooKeeper watches fire at most once, so a continuous view of a node is a
//! chain: read under a watch, wait for it to fire, read again. The watcher
//! runs two such chains per path (data and children) and keeps them honest
//! across node deletion and recreation, where children watches do not
//! survive and data watches must fall back to existence checks.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tracing::{trace, warn};

use crate::zk::{NodeStat, NodeWatch, WatchKind, WatchedEvent, ZkError, ZkOps};

/// How long a chain sleeps after a transient read failure.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Live view of one znode: data, data version, and children.
///
/// All fields `None` means the node does not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeView {
    /// Raw node payload.
    pub data: Option<Vec<u8>>,
    /// Data version reported by the last read.
    pub version: Option<i32>,
    /// Child names, unordered.
    pub children: Option<Vec<String>>,
}

impl NodeView {
    /// True when the last read found no node at the path.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.data.is_none() && self.version.is_none() && self.children.is_none()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

enum ChainEvent {
    Shutdown,
    Data(Option<WatchedEvent>),
    Children(Option<WatchedEvent>),
}

/// Maintains a [`NodeView`] of one path by chaining one-shot watches.
///
/// The initial snapshot is delivered exactly once through the receiver
/// returned by [`spawn`](Self::spawn); afterwards the full view is sent on
/// the changes channel after every resolved read, until the shutdown flag
/// flips. No change is ever delivered before the snapshot.
pub struct NodeWatcher {
    ops: Arc<dyn ZkOps>,
    path: String,
    changes: mpsc::UnboundedSender<NodeView>,
    shutdown: watch::Receiver<bool>,
    view: NodeView,
    prev_stat: Option<NodeStat>,
    data_watch: Option<NodeWatch>,
    children_watch: Option<NodeWatch>,
}

impl NodeWatcher {
    /// Spawns a watcher task for `path`.
    pub fn spawn(
        ops: Arc<dyn ZkOps>,
        path: impl Into<String>,
        changes: mpsc::UnboundedSender<NodeView>,
        shutdown: watch::Receiver<bool>,
    ) -> oneshot::Receiver<NodeView> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let watcher = Self {
            ops,
            path: path.into(),
            changes,
            shutdown,
            view: NodeView::default(),
            prev_stat: None,
            data_watch: None,
            children_watch: None,
        };
        tokio::spawn(watcher.run(ready_tx));
        ready_rx
    }

    async fn run(mut self, ready: oneshot::Sender<NodeView>) {
        if !self.initial_read().await {
            return;
        }
        trace!(path = %self.path, absent = self.view.is_absent(), "initial snapshot taken");
        if ready.send(self.view.clone()).is_err() {
            return;
        }
        self.watch_loop().await;
    }

    fn closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// First data read. Seeds the children chain when the node exists, and
    /// falls back to an existence watch when it does not, since `getData`
    /// cannot arm anything on an absent node.
    async fn initial_read(&mut self) -> bool {
        loop {
            if self.closed() {
                return false;
            }
            match self.ops.get_and_watch_data(&self.path).await {
                Ok((data, stat, watch)) => {
                    self.view.data = Some(data);
                    self.view.version = Some(stat.version);
                    self.prev_stat = Some(stat);
                    self.data_watch = Some(watch);
                    return self.read_children().await;
                }
                Err(err) if err.is_no_node() => {
                    self.view.clear();
                    self.prev_stat = None;
                    match self.ops.check_and_watch_stat(&self.path).await {
                        Ok((None, watch)) => {
                            self.data_watch = Some(watch);
                            return true;
                        }
                        // Appeared between the two calls; read it for real.
                        Ok((Some(_), _)) => {}
                        Err(err) => {
                            if !self.retry_pause(&err).await {
                                return false;
                            }
                        }
                    }
                }
                Err(err) => {
                    if !self.retry_pause(&err).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn watch_loop(&mut self) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.changed() => ChainEvent::Shutdown,
                event = Self::fired(&mut self.data_watch) => ChainEvent::Data(event),
                event = Self::fired(&mut self.children_watch) => ChainEvent::Children(event),
            };
            let proceed = match event {
                ChainEvent::Shutdown => false,
                ChainEvent::Data(event) => {
                    trace!(path = %self.path, ?event, "data watch fired");
                    self.rearm_data(event).await
                }
                ChainEvent::Children(Some(event)) => {
                    trace!(path = %self.path, ?event, "children watch fired");
                    self.refresh_children().await
                }
                // The session dropped the watch; the chain parks until the
                // data chain (or a session rebuild) revives it.
                ChainEvent::Children(None) => true,
            };
            if !proceed {
                return;
            }
        }
    }

    /// Awaits a slot's one-shot watch, emptying the slot once it resolves.
    async fn fired(slot: &mut Option<NodeWatch>) -> Option<WatchedEvent> {
        match slot {
            Some(watch) => {
                let event = watch.await.ok();
                *slot = None;
                event
            }
            None => pending().await,
        }
    }

    /// Re-arms the data watch through an existence check, repairing any
    /// update missed between the watch firing and this read.
    async fn rearm_data(&mut self, event: Option<WatchedEvent>) -> bool {
        if matches!(
            event,
            Some(WatchedEvent {
                kind: WatchKind::NodeDeleted,
                ..
            })
        ) {
            // A recreated node restarts at version zero, so after a deletion
            // the cached version proves nothing. The stat cache goes with
            // it: the existence check below may already see the recreated
            // node, and the children chain has to be reseeded even then.
            self.view.version = None;
            self.prev_stat = None;
        }
        loop {
            if self.closed() {
                return false;
            }
            match self.ops.check_and_watch_stat(&self.path).await {
                Ok((Some(stat), watch)) => {
                    self.data_watch = Some(watch);
                    // Children watches did not survive if the node was
                    // deleted and recreated; reseed the chain.
                    let reseed = self.prev_stat.is_none();
                    if self.view.version != Some(stat.version) {
                        match self.ops.get_data(&self.path).await {
                            Ok((data, stat)) => {
                                self.view.data = Some(data);
                                self.view.version = Some(stat.version);
                                self.prev_stat = Some(stat);
                            }
                            Err(err) if err.is_no_node() => {
                                // Deleted again before the read; the armed
                                // watch reports the deletion.
                                self.view.clear();
                                self.prev_stat = None;
                                self.children_watch = None;
                                return self.deliver();
                            }
                            Err(err) => {
                                if !self.retry_pause(&err).await {
                                    return false;
                                }
                                continue;
                            }
                        }
                    } else {
                        self.prev_stat = Some(stat);
                    }
                    if reseed && !self.read_children().await {
                        return false;
                    }
                    return self.deliver();
                }
                Ok((None, watch)) => {
                    self.data_watch = Some(watch);
                    self.view.clear();
                    self.prev_stat = None;
                    self.children_watch = None;
                    return self.deliver();
                }
                Err(err) => {
                    if !self.retry_pause(&err).await {
                        return false;
                    }
                }
            }
        }
    }

    /// One children read under a fresh one-shot watch.
    ///
    /// `NoNode` parks the chain silently; the data chain reseeds it when
    /// the node comes back.
    async fn read_children(&mut self) -> bool {
        loop {
            if self.closed() {
                return false;
            }
            match self.ops.get_and_watch_children(&self.path).await {
                Ok((children, watch)) => {
                    self.view.children = Some(children);
                    self.children_watch = Some(watch);
                    return true;
                }
                Err(err) if err.is_no_node() => {
                    self.children_watch = None;
                    return true;
                }
                Err(err) => {
                    if !self.retry_pause(&err).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Children watch fired: re-read under a fresh watch and notify.
    async fn refresh_children(&mut self) -> bool {
        if !self.read_children().await {
            return false;
        }
        if self.children_watch.is_some() {
            self.deliver()
        } else {
            true
        }
    }

    /// Sleeps out the transient-failure delay; false once shut down.
    async fn retry_pause(&mut self, err: &ZkError) -> bool {
        warn!(path = %self.path, error = %err, "zookeeper read failed, retrying");
        tokio::select! {
            _ = self.shutdown.changed() => false,
            () = time::sleep(RETRY_DELAY) => !self.closed(),
        }
    }

    /// Pushes the current view to the owner; false when it hung up.
    fn deliver(&self) -> bool {
        self.changes.send(self.view.clone()).is_ok()
    }
}
