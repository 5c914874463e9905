use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`ShardClient`](crate::client::ShardClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Shard ZooKeeper path, e.g. `/manatee/1.moray.coal.joyent.us`.
    pub path: String,
    /// ZooKeeper connection settings.
    #[serde(default)]
    pub zk: ZkConfig,
}

impl ClientConfig {
    /// Creates a configuration for the given shard path and ensemble.
    pub fn new(path: impl Into<String>, conn_str: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            zk: ZkConfig {
                conn_str: conn_str.into(),
                ..ZkConfig::default()
            },
        }
    }

    /// Path of the cluster-state node.
    #[must_use]
    pub fn state_path(&self) -> String {
        format!("{}/state", self.path)
    }

    /// Path of the election directory.
    #[must_use]
    pub fn election_path(&self) -> String {
        format!("{}/election", self.path)
    }
}

/// ZooKeeper session tunables.
///
/// `session_timeout` is forwarded to the session layer; the remaining knobs
/// pace the client's own connection attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZkConfig {
    /// Comma-separated `host:port` ensemble list.
    pub conn_str: String,
    /// Requested session timeout.
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// Delay between consecutive connection attempts.
    #[serde(with = "humantime_serde")]
    pub spin_delay: Duration,
    /// Connection attempts per session establishment before the delay
    /// widens to the session timeout.
    pub retries: usize,
}

impl Default for ZkConfig {
    fn default() -> Self {
        Self {
            conn_str: String::new(),
            session_timeout: Duration::from_secs(30),
            spin_delay: Duration::from_secs(1),
            retries: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_append_well_known_nodes() {
        let config = ClientConfig::new("/manatee/1.moray.coal.joyent.us", "zk1:2181");
        assert_eq!(config.state_path(), "/manatee/1.moray.coal.joyent.us/state");
        assert_eq!(
            config.election_path(),
            "/manatee/1.moray.coal.joyent.us/election"
        );
    }

    #[test]
    fn zk_tunables_deserialize_with_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"path": "/manatee/shard", "zk": {"conn_str": "a:2181,b:2181", "session_timeout": "10s"}}"#,
        )
        .expect("config parses");
        assert_eq!(config.zk.conn_str, "a:2181,b:2181");
        assert_eq!(config.zk.session_timeout, Duration::from_secs(10));
        assert_eq!(config.zk.retries, 5);
    }
}
