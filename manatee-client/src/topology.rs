use serde::{Deserialize, Serialize};

use crate::peer::{self, PeerUrl};

/// Authoritative cluster-state document stored at `<shardPath>/state`.
///
/// Every recognized field is optional and unknown fields are ignored, so the
/// client keeps working across Manatee versions that add bookkeeping to the
/// document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    /// Current primary peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<PeerEntry>,
    /// Synchronous standby.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<PeerEntry>,
    /// Asynchronous standbys in replication-chain order.
    #[serde(default, rename = "async", skip_serializing_if = "Vec::is_empty")]
    pub asyncs: Vec<PeerEntry>,
}

/// One peer slot inside the cluster-state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Advertised PostgreSQL URL of the peer.
    #[serde(rename = "pgUrl")]
    pub pg_url: PeerUrl,
}

impl PeerEntry {
    /// Creates an entry for the given URL.
    pub fn new(pg_url: PeerUrl) -> Self {
        Self { pg_url }
    }
}

/// Reduces the two ZooKeeper sources into the published peer ordering.
///
/// The cluster-state document wins whenever present, even when it names no
/// peers at all; otherwise the sorted election children are decoded in
/// order; with neither source the topology is empty.
#[must_use]
pub fn reduce(state: Option<&ClusterState>, sorted_actives: Option<&[String]>) -> Vec<PeerUrl> {
    if let Some(state) = state {
        let mut urls = Vec::with_capacity(2 + state.asyncs.len());
        if let Some(primary) = &state.primary {
            urls.push(primary.pg_url.clone());
        }
        if let Some(sync) = &state.sync {
            urls.push(sync.pg_url.clone());
        }
        urls.extend(state.asyncs.iter().map(|entry| entry.pg_url.clone()));
        return urls;
    }
    match sorted_actives {
        Some(actives) => actives
            .iter()
            .map(|name| peer::decode_child(name))
            .collect(),
        None => Vec::new(),
    }
}
