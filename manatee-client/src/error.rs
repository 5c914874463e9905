use thiserror::Error;

use crate::zk::ZkError;

/// Errors surfaced by the shard client and resolver.
///
/// Cloneable so a single failure can ride the broadcast event stream and be
/// retained as the resolver's last observed error.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// ZooKeeper failure that could not be retried away.
    #[error(transparent)]
    Zk(#[from] ZkError),
    /// The cluster-state node held a payload that is not valid UTF-8 JSON.
    #[error("malformed cluster state: {0}")]
    InvalidClusterState(String),
    /// The head of a topology was not a literal `tcp://<ip>:<port>` URL.
    #[error("malformed primary url: {0}")]
    MalformedPrimaryUrl(String),
}
