//! Primary-only resolver layered on the shard client.
//!
//! Consumers that only care about the primary (connection pools, health
//! checkers) get a small state machine instead of the raw topology stream:
//! one tracked record at a time, identified by an opaque key that is minted
//! fresh for every observed primary and never reused.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::client::{ShardClient, ShardEvent};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::peer::PeerUrl;
use crate::zk::{ZkBackend, ZkError};

/// Delay before a failed resolver attempts a fresh client.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the outbound event channel.
const EVENT_CAPACITY: usize = 64;

/// Lifecycle states of a [`PrimaryResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolverState {
    /// Not running; the initial state.
    #[default]
    Stopped,
    /// Waiting for the underlying client to become ready.
    Starting,
    /// Tracking the primary.
    Running,
    /// The client errored; a restart is pending.
    Failed,
    /// Winding down the underlying client.
    Stopping,
}

/// The tracked primary, keyed by an opaque identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryRecord {
    /// Always `"primary"`.
    pub name: &'static str,
    /// Literal IP address of the primary.
    pub address: IpAddr,
    /// PostgreSQL port.
    pub port: u16,
    /// Opaque identity; fresh for every observed primary.
    pub key: String,
}

/// Events published by the resolver.
#[derive(Debug, Clone)]
pub enum ResolverEvent {
    /// A new primary was observed. For a transition, this precedes the
    /// matching [`Removed`](Self::Removed).
    Added {
        /// Opaque key identifying this primary instance.
        key: String,
        /// The primary's record.
        record: PrimaryRecord,
    },
    /// A previously added primary is gone; its key retires.
    Removed {
        /// Key handed out by the matching `Added`.
        key: String,
    },
}

#[derive(Default)]
struct Shared {
    state: ResolverState,
    primary: Option<PrimaryRecord>,
    previous: Option<PrimaryRecord>,
    last_error: Option<ClientError>,
}

/// Tracks only the shard primary, emitting add/remove transitions.
///
/// One [`ShardClient`] is spawned per start cycle; a client error parks the
/// resolver in [`ResolverState::Failed`] for a second before a fresh cycle
/// begins.
pub struct PrimaryResolver {
    config: ClientConfig,
    backend: Arc<dyn ZkBackend>,
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<ResolverEvent>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PrimaryResolver {
    /// Creates a resolver for the configured shard. Call
    /// [`start`](Self::start) to begin resolving.
    #[must_use]
    pub fn new(config: ClientConfig, backend: Arc<dyn ZkBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            backend,
            shared: Arc::new(Mutex::new(Shared::default())),
            events,
            stop: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Begins resolving.
    ///
    /// # Panics
    ///
    /// Calling this anywhere but [`ResolverState::Stopped`] is a
    /// programming error.
    pub fn start(&self) {
        {
            let mut shared = self.shared.lock();
            assert!(
                shared.state == ResolverState::Stopped,
                "start requires a stopped resolver"
            );
            shared.state = ResolverState::Starting;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = ResolverTask {
            config: self.config.clone(),
            backend: Arc::clone(&self.backend),
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            stop: stop_rx,
        };
        *self.stop.lock() = Some(stop_tx);
        *self.task.lock() = Some(tokio::spawn(task.run()));
    }

    /// Stops resolving and waits for the underlying client to close.
    ///
    /// # Panics
    ///
    /// Calling this anywhere but [`ResolverState::Running`] or
    /// [`ResolverState::Failed`] is a programming error.
    pub async fn stop(&self) {
        {
            let shared = self.shared.lock();
            assert!(
                matches!(
                    shared.state,
                    ResolverState::Running | ResolverState::Failed
                ),
                "stop requires a running or failed resolver"
            );
        }
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(true);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Subscribes to add/remove notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ResolverEvent> {
        self.events.subscribe()
    }

    /// Number of tracked primaries: zero or one.
    #[must_use]
    pub fn count(&self) -> usize {
        usize::from(self.shared.lock().primary.is_some())
    }

    /// Snapshot of the tracked primary keyed by its opaque identity.
    #[must_use]
    pub fn list(&self) -> HashMap<String, PrimaryRecord> {
        self.shared
            .lock()
            .primary
            .iter()
            .map(|record| (record.key.clone(), record.clone()))
            .collect()
    }

    /// Last error observed from the underlying client, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<ClientError> {
        self.shared.lock().last_error.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ResolverState {
        self.shared.lock().state
    }
}

enum Cycle {
    Stop,
    Failed(ClientError),
}

struct ResolverTask {
    config: ClientConfig,
    backend: Arc<dyn ZkBackend>,
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<ResolverEvent>,
    stop: watch::Receiver<bool>,
}

impl ResolverTask {
    async fn run(mut self) {
        loop {
            self.set_state(ResolverState::Starting);
            let client = ShardClient::spawn(self.config.clone(), Arc::clone(&self.backend));
            let mut stream = client.subscribe();
            match self.drive(&mut stream).await {
                Cycle::Stop => {
                    self.shutdown_client(client, &mut stream).await;
                    self.set_state(ResolverState::Stopped);
                    return;
                }
                Cycle::Failed(err) => {
                    warn!(shard = %self.config.path, error = %err, "resolver cycle failed");
                    {
                        let mut shared = self.shared.lock();
                        shared.state = ResolverState::Failed;
                        shared.last_error = Some(err);
                        // Remember the cleared primary so its key can be
                        // retired when a successor appears.
                        if let Some(primary) = shared.primary.take() {
                            shared.previous = Some(primary);
                        }
                    }
                    self.shutdown_client(client, &mut stream).await;
                    let stopped = tokio::select! {
                        _ = self.stop.changed() => true,
                        () = time::sleep(RESTART_DELAY) => false,
                    };
                    if stopped {
                        self.set_state(ResolverState::Stopped);
                        return;
                    }
                }
            }
        }
    }

    /// Runs the starting and running phases for one client cycle.
    async fn drive(&mut self, stream: &mut broadcast::Receiver<ShardEvent>) -> Cycle {
        // Starting: wait for the client to become ready.
        loop {
            let Some(event) = self.next_event(stream).await else {
                return Cycle::Stop;
            };
            match event {
                Ok(ShardEvent::Ready) => break,
                Ok(ShardEvent::Error(err)) => return Cycle::Failed(err),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "resolver lagged behind client events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Cycle::Failed(ClientError::Zk(ZkError::Closed));
                }
            }
        }
        self.set_state(ResolverState::Running);
        info!(shard = %self.config.path, "resolver running");

        loop {
            let Some(event) = self.next_event(stream).await else {
                self.set_state(ResolverState::Stopping);
                return Cycle::Stop;
            };
            match event {
                Ok(ShardEvent::Topology(urls)) => {
                    if let Err(err) = self.handle_topology(&urls) {
                        return Cycle::Failed(err);
                    }
                }
                Ok(ShardEvent::Error(err)) => return Cycle::Failed(err),
                Ok(ShardEvent::Ready | ShardEvent::Close) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "resolver lagged behind client events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Cycle::Failed(ClientError::Zk(ZkError::Closed));
                }
            }
        }
    }

    /// Next client event, or `None` when stop was requested.
    async fn next_event(
        &mut self,
        stream: &mut broadcast::Receiver<ShardEvent>,
    ) -> Option<Result<ShardEvent, broadcast::error::RecvError>> {
        tokio::select! {
            _ = self.stop.changed() => None,
            event = stream.recv() => Some(event),
        }
    }

    /// Applies one topology emission while running.
    fn handle_topology(&mut self, urls: &[PeerUrl]) -> Result<(), ClientError> {
        let Some(primary_url) = urls.first() else {
            debug!(shard = %self.config.path, "empty topology; primary unchanged");
            return Ok(());
        };
        let (address, port) = parse_primary(primary_url)?;

        let (record, retired) = {
            let mut shared = self.shared.lock();
            if let Some(current) = &shared.primary
                && current.address == address
                && current.port == port
            {
                return Ok(());
            }
            let record = PrimaryRecord {
                name: "primary",
                address,
                port,
                key: fresh_key(),
            };
            let retired = shared
                .primary
                .replace(record.clone())
                .or_else(|| shared.previous.take());
            (record, retired)
        };

        info!(shard = %self.config.path, primary = %primary_url, key = %record.key, "primary changed");
        let _ = self.events.send(ResolverEvent::Added {
            key: record.key.clone(),
            record,
        });
        if let Some(old) = retired {
            let _ = self.events.send(ResolverEvent::Removed { key: old.key });
        }
        Ok(())
    }

    /// Stopping: close the client and wait for its close notification.
    async fn shutdown_client(
        &mut self,
        client: ShardClient,
        stream: &mut broadcast::Receiver<ShardEvent>,
    ) {
        client.close();
        loop {
            match stream.recv().await {
                Ok(ShardEvent::Close) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
        client.wait().await;
    }

    fn set_state(&self, state: ResolverState) {
        self.shared.lock().state = state;
        debug!(shard = %self.config.path, ?state, "resolver state");
    }
}

/// Validates the head of a topology as a literal `tcp://<ip>:<port>` URL.
///
/// The shard client only ever produces `tcp://` URLs, so a miss here is a
/// contract violation rather than bad operator input.
fn parse_primary(url: &PeerUrl) -> Result<(IpAddr, u16), ClientError> {
    let malformed = || ClientError::MalformedPrimaryUrl(url.to_string());
    let (host, port) = url.host_port().ok_or_else(malformed)?;
    let port = port
        .ok_or_else(malformed)?
        .parse::<u16>()
        .map_err(|_| malformed())?;
    let address = host.parse::<IpAddr>().map_err(|_| malformed())?;
    Ok((address, port))
}

/// Mints an opaque primary identity: 9 random bytes as 12 base64 chars.
fn fresh_key() -> String {
    let mut bytes = [0u8; 9];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD_NO_PAD.encode(bytes)
}
