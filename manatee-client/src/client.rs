//! Shard client: session lifecycle, watch setup, and topology emission.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::peer::{self, PeerUrl};
use crate::topology::{self, ClusterState};
use crate::watcher::{NodeView, NodeWatcher};
use crate::zk::{SessionEvent, ZkBackend, ZkSession};

/// Capacity of the outbound event channel.
const EVENT_CAPACITY: usize = 256;

/// Notifications published by a [`ShardClient`].
#[derive(Debug, Clone)]
pub enum ShardEvent {
    /// First successful watch setup completed. Emitted once per client,
    /// before any topology.
    Ready,
    /// The derived peer ordering changed. Consecutive emissions are never
    /// element-wise equal.
    Topology(Vec<PeerUrl>),
    /// Unrecoverable protocol violation; consumers should build a new
    /// client.
    Error(ClientError),
    /// Shutdown finished; no further events follow.
    Close,
}

/// Watches one Manatee shard and publishes its peer ordering.
///
/// Construction spawns a background session task that connects, arms the
/// cluster-state and election watchers, and keeps both alive across
/// transient disconnects and session expiry. Consumers read the event
/// stream via [`subscribe`](Self::subscribe) and call
/// [`close`](Self::close) when done.
pub struct ShardClient {
    events: broadcast::Sender<ShardEvent>,
    seed: Mutex<Option<broadcast::Receiver<ShardEvent>>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ShardClient {
    /// Spawns a client for the configured shard.
    #[must_use]
    pub fn spawn(config: ClientConfig, backend: Arc<dyn ZkBackend>) -> Self {
        let (events, seed) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = SessionTask {
            config,
            backend,
            events: events.clone(),
            shutdown: shutdown_rx,
            inited: false,
            errored: false,
            cluster_state: None,
            actives: None,
            urls: Vec::new(),
        };
        Self {
            events,
            seed: Mutex::new(Some(seed)),
            shutdown: shutdown_tx,
            task: tokio::spawn(task.run()),
        }
    }

    /// Subscribes to the event stream.
    ///
    /// The first subscription observes every event since the client was
    /// spawned; later subscriptions start from the current position.
    pub fn subscribe(&self) -> broadcast::Receiver<ShardEvent> {
        self.seed
            .lock()
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    /// Requests shutdown. The task closes the ZooKeeper handle and emits
    /// [`ShardEvent::Close`] exactly once.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits for the session task to exit.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

enum SessionOutcome {
    Reset,
    Closed,
}

enum Pulse {
    Shutdown,
    State(Option<NodeView>),
    Election(Option<NodeView>),
    Session(Option<SessionEvent>),
}

enum ReadyOutcome {
    View(NodeView),
    Reset,
    Closed,
}

struct SessionTask {
    config: ClientConfig,
    backend: Arc<dyn ZkBackend>,
    events: broadcast::Sender<ShardEvent>,
    shutdown: watch::Receiver<bool>,
    inited: bool,
    errored: bool,
    cluster_state: Option<ClusterState>,
    actives: Option<Vec<String>>,
    urls: Vec<PeerUrl>,
}

impl SessionTask {
    async fn run(mut self) {
        loop {
            match self.run_session().await {
                SessionOutcome::Reset => {
                    debug!(shard = %self.config.path, "rebuilding zookeeper session");
                }
                SessionOutcome::Closed => break,
            }
        }
        let _ = self.events.send(ShardEvent::Close);
    }

    /// One full session: connect, arm watches, pump events until the
    /// session dies or shutdown is requested.
    async fn run_session(&mut self) -> SessionOutcome {
        let Some(mut session) = self.connect().await else {
            return SessionOutcome::Closed;
        };
        // Fresh session, fresh sources; the initial reads repopulate them.
        // The debounce cache and the init latch deliberately survive.
        self.cluster_state = None;
        self.actives = None;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let (election_tx, mut election_rx) = mpsc::unbounded_channel();

        // State watcher first, election second; readiness requires both
        // initial reads.
        let ready = NodeWatcher::spawn(
            Arc::clone(&session.ops),
            self.config.state_path(),
            state_tx,
            stop_rx.clone(),
        );
        match self.await_ready(ready, &mut session).await {
            ReadyOutcome::View(view) => self.handle_cluster_state(view),
            ReadyOutcome::Reset => {
                self.teardown(&stop_tx, &session).await;
                return SessionOutcome::Reset;
            }
            ReadyOutcome::Closed => {
                self.teardown(&stop_tx, &session).await;
                return SessionOutcome::Closed;
            }
        }
        let ready = NodeWatcher::spawn(
            Arc::clone(&session.ops),
            self.config.election_path(),
            election_tx,
            stop_rx.clone(),
        );
        match self.await_ready(ready, &mut session).await {
            ReadyOutcome::View(view) => self.handle_active(view),
            ReadyOutcome::Reset => {
                self.teardown(&stop_tx, &session).await;
                return SessionOutcome::Reset;
            }
            ReadyOutcome::Closed => {
                self.teardown(&stop_tx, &session).await;
                return SessionOutcome::Closed;
            }
        }

        if !self.inited {
            self.inited = true;
            info!(shard = %self.config.path, peers = self.urls.len(), "watches armed");
            let _ = self.events.send(ShardEvent::Ready);
            let _ = self.events.send(ShardEvent::Topology(self.urls.clone()));
        }

        loop {
            let pulse = tokio::select! {
                _ = self.shutdown.changed() => Pulse::Shutdown,
                view = state_rx.recv() => Pulse::State(view),
                view = election_rx.recv() => Pulse::Election(view),
                event = session.events.recv() => Pulse::Session(event),
            };
            match pulse {
                Pulse::Shutdown => {
                    self.teardown(&stop_tx, &session).await;
                    return SessionOutcome::Closed;
                }
                Pulse::State(Some(view)) => self.handle_cluster_state(view),
                Pulse::Election(Some(view)) => self.handle_active(view),
                Pulse::State(None) | Pulse::Election(None) => {
                    warn!(shard = %self.config.path, "watcher stopped unexpectedly");
                    self.teardown(&stop_tx, &session).await;
                    return SessionOutcome::Reset;
                }
                Pulse::Session(event) => match event {
                    Some(SessionEvent::Expired) => {
                        warn!(shard = %self.config.path, "zookeeper session expired");
                        self.teardown(&stop_tx, &session).await;
                        return SessionOutcome::Reset;
                    }
                    Some(SessionEvent::Faulted(reason)) => {
                        warn!(shard = %self.config.path, reason = %reason, "zookeeper handle fault");
                        self.teardown(&stop_tx, &session).await;
                        return SessionOutcome::Reset;
                    }
                    Some(SessionEvent::AuthFailed) => {
                        // No automatic recovery; the session will fail or
                        // expire on its own terms.
                        error!(shard = %self.config.path, "zookeeper authentication failed");
                    }
                    Some(SessionEvent::Disconnected) => {
                        debug!(shard = %self.config.path, "zookeeper disconnected");
                    }
                    Some(SessionEvent::ConnectedReadOnly) => {
                        debug!(shard = %self.config.path, "connected to read-only member");
                    }
                    Some(SessionEvent::Connected) => {
                        trace!(shard = %self.config.path, "zookeeper connected");
                    }
                    None => {
                        warn!(shard = %self.config.path, "session event stream ended");
                        self.teardown(&stop_tx, &session).await;
                        return SessionOutcome::Reset;
                    }
                },
            }
        }
    }

    /// Establishes a session, pacing attempts with the configured spin
    /// delay. `None` means shutdown arrived while connecting.
    async fn connect(&mut self) -> Option<ZkSession> {
        let mut attempts = 0usize;
        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            match self.backend.connect(&self.config.zk).await {
                Ok(session) => {
                    debug!(shard = %self.config.path, "zookeeper session connected");
                    return Some(session);
                }
                Err(err) => {
                    attempts += 1;
                    let delay = if attempts < self.config.zk.retries {
                        self.config.zk.spin_delay
                    } else {
                        self.config.zk.session_timeout.max(self.config.zk.spin_delay)
                    };
                    warn!(
                        shard = %self.config.path,
                        error = %err,
                        attempts,
                        "zookeeper connect failed"
                    );
                    let shutdown = tokio::select! {
                        _ = self.shutdown.changed() => true,
                        () = time::sleep(delay) => false,
                    };
                    if shutdown {
                        return None;
                    }
                }
            }
        }
    }

    /// Waits for a watcher's initial snapshot while honoring session
    /// faults and shutdown.
    async fn await_ready(
        &mut self,
        mut ready: oneshot::Receiver<NodeView>,
        session: &mut ZkSession,
    ) -> ReadyOutcome {
        loop {
            let outcome = tokio::select! {
                _ = self.shutdown.changed() => Some(ReadyOutcome::Closed),
                view = &mut ready => Some(match view {
                    Ok(view) => ReadyOutcome::View(view),
                    Err(_) => ReadyOutcome::Reset,
                }),
                event = session.events.recv() => match event {
                    Some(SessionEvent::Expired | SessionEvent::Faulted(_)) | None => {
                        Some(ReadyOutcome::Reset)
                    }
                    Some(_) => None,
                },
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    /// Detaches the watchers and releases the session handle.
    async fn teardown(&self, stop: &watch::Sender<bool>, session: &ZkSession) {
        let _ = stop.send(true);
        session.ops.close().await;
    }

    /// Applies a cluster-state node view.
    fn handle_cluster_state(&mut self, view: NodeView) {
        let Some(data) = view.data else {
            if !self.inited {
                // Absent at startup; the election directory carries the
                // ordering until the node appears.
                return;
            }
            debug!(shard = %self.config.path, "cluster state node deleted");
            self.cluster_state = None;
            if self.actives.is_some() {
                self.recompute();
            }
            return;
        };
        let parsed = std::str::from_utf8(&data)
            .map_err(|err| err.to_string())
            .and_then(|text| {
                serde_json::from_str::<ClusterState>(text).map_err(|err| err.to_string())
            });
        match parsed {
            Ok(state) => {
                trace!(shard = %self.config.path, "cluster state updated");
                self.cluster_state = Some(state);
                self.recompute();
            }
            Err(detail) => {
                error!(shard = %self.config.path, detail = %detail, "cluster state unparseable");
                self.fail(ClientError::InvalidClusterState(detail));
            }
        }
    }

    /// Applies an election-directory view.
    fn handle_active(&mut self, view: NodeView) {
        let Some(children) = view.children else {
            self.actives = None;
            return;
        };
        let sorted = peer::sort_children(children);
        trace!(shard = %self.config.path, actives = sorted.len(), "election children updated");
        self.actives = Some(sorted);
        if self.cluster_state.is_none() {
            // Cluster state wins while present; actives only matter
            // without it.
            self.recompute();
        }
    }

    /// Reduces the current sources and emits when the ordering changed.
    fn recompute(&mut self) {
        let urls = topology::reduce(self.cluster_state.as_ref(), self.actives.as_deref());
        if urls == self.urls {
            return;
        }
        self.urls = urls;
        if self.inited {
            debug!(shard = %self.config.path, peers = self.urls.len(), "topology changed");
            let _ = self.events.send(ShardEvent::Topology(self.urls.clone()));
        }
    }

    /// Surfaces an unrecoverable protocol violation, at most once.
    fn fail(&mut self, err: ClientError) {
        if !self.errored {
            self.errored = true;
            let _ = self.events.send(ShardEvent::Error(err));
        }
    }
}
