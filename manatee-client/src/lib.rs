//! Shard-topology discovery client for Manatee PostgreSQL clusters.
//!
//! A Manatee shard advertises itself through two ZooKeeper sources of truth:
//! the cluster-state document at `<shardPath>/state` and the
//! ephemeral-sequential election directory at `<shardPath>/election`. This
//! crate watches both, reconciles them under the cluster-state-wins
//! precedence rule, and publishes the authoritative peer ordering (primary,
//! synchronous standby, then asynchronous standbys) to local consumers,
//! emitting a notification only when the derived ordering actually changes.
//!
//! The moving parts, leaves first:
//!
//! - [`peer`] decodes election node names into `tcp://` peer URLs and sorts
//!   them by ZooKeeper sequence number.
//! - [`topology`] models the cluster-state document and reduces the two
//!   sources into one ordering.
//! - [`watcher`] keeps a live view of a single znode by chaining one-shot
//!   watches.
//! - [`client`] owns the ZooKeeper session, arms the two watchers, and emits
//!   debounced [`ShardEvent`]s.
//! - [`resolver`] layers a primary-only state machine on top, publishing
//!   add/remove transitions keyed by opaque identities.
//!
//! Sessions are produced by a [`zk::ZkBackend`]: [`zk::live::LiveZk`] speaks
//! to a real ensemble, while [`zk::sim::SimZk`] is an in-process double used
//! by the test suites and local development.

/// Shard client: session lifecycle, watch setup, topology emission.
pub mod client;
/// Client and session configuration.
pub mod config;
/// Crate-level error types.
pub mod error;
/// Election node name decoding and peer URLs.
pub mod peer;
/// Primary-only resolver state machine.
pub mod resolver;
/// Cluster-state document model and the precedence reducer.
pub mod topology;
/// One-shot-watch chaining for a single znode.
pub mod watcher;
/// ZooKeeper session seam, live adapter, and simulated ensemble.
pub mod zk;

pub use client::{ShardClient, ShardEvent};
pub use config::{ClientConfig, ZkConfig};
pub use error::ClientError;
pub use peer::{PeerUrl, decode_child, sort_children};
pub use resolver::{PrimaryRecord, PrimaryResolver, ResolverEvent, ResolverState};
pub use topology::{ClusterState, PeerEntry, reduce};
pub use watcher::{NodeView, NodeWatcher};
