use std::fmt;

use serde::{Deserialize, Serialize};

/// A database peer address of the form `tcp://<host>[:<port>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerUrl(String);

impl PeerUrl {
    /// Wraps an already-formed `tcp://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// Returns the URL as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the URL into host and optional port.
    ///
    /// Returns `None` when the scheme is not `tcp`. Bracketed IPv6 hosts
    /// (`tcp://[::1]:5432`) are unwrapped; an unbracketed multi-colon rest
    /// is treated as a bare IPv6 host with no port.
    #[must_use]
    pub fn host_port(&self) -> Option<(&str, Option<&str>)> {
        let rest = self.0.strip_prefix("tcp://")?;
        if let Some(inner) = rest.strip_prefix('[') {
            let (host, tail) = inner.split_once(']')?;
            return Some((host, tail.strip_prefix(':')));
        }
        match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Some((host, Some(port))),
            _ => Some((rest, None)),
        }
    }
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decodes an election node name into the peer URL it advertises.
///
/// Two legacy-compatible encodings exist: `<host>-<seq>` maps to
/// `tcp://<host>`, and `<host>:<pgPort>:<backupPort>:<hbPort>-<seq>` maps to
/// `tcp://<host>:<pgPort>`. Everything after the last `-` is the ZooKeeper
/// sequence number; colon fields past the PostgreSQL port are non-PG ports
/// and are ignored.
#[must_use]
pub fn decode_child(name: &str) -> PeerUrl {
    let prefix = match name.rsplit_once('-') {
        Some((prefix, _seq)) => prefix,
        None => name,
    };
    let mut fields = prefix.split(':');
    let host = fields.next().unwrap_or(prefix);
    match fields.next() {
        Some(port) => PeerUrl(format!("tcp://{host}:{port}")),
        None => PeerUrl(format!("tcp://{host}")),
    }
}

/// Sorts election children by ZooKeeper sequence number, ascending.
///
/// The sort is stable; names without a parseable sequence tail are a
/// producer bug and sink to the end in their original order.
#[must_use]
pub fn sort_children(mut children: Vec<String>) -> Vec<String> {
    children.sort_by_key(|name| sequence_of(name));
    children
}

fn sequence_of(name: &str) -> u64 {
    name.rsplit_once('-')
        .and_then(|(_, tail)| tail.parse().ok())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bare_host_encoding() {
        let url = decode_child("10.77.77.8-0000000012");
        assert_eq!(url.as_str(), "tcp://10.77.77.8");
    }

    #[test]
    fn decodes_port_list_encoding() {
        let url = decode_child("10.77.77.8:5432:12345:8080-0000000012");
        assert_eq!(url.as_str(), "tcp://10.77.77.8:5432");
    }

    #[test]
    fn extra_colon_fields_are_ignored() {
        let url = decode_child("host:5432:1:2:3:4-0000000001");
        assert_eq!(url.as_str(), "tcp://host:5432");
    }

    #[test]
    fn sorts_by_sequence_not_lexicographically() {
        let sorted = sort_children(vec![
            "b-0000000010".to_string(),
            "a-0000000002".to_string(),
            "c-0000000001".to_string(),
        ]);
        assert_eq!(sorted, vec!["c-0000000001", "a-0000000002", "b-0000000010"]);
    }

    #[test]
    fn sort_is_stable_for_malformed_tails() {
        let sorted = sort_children(vec![
            "first-bogus".to_string(),
            "a-0000000005".to_string(),
            "second-bogus".to_string(),
        ]);
        assert_eq!(sorted, vec!["a-0000000005", "first-bogus", "second-bogus"]);
    }

    #[test]
    fn host_port_handles_all_shapes() {
        assert_eq!(
            PeerUrl::new("tcp://1.2.3.4:5432").host_port(),
            Some(("1.2.3.4", Some("5432")))
        );
        assert_eq!(
            PeerUrl::new("tcp://1.2.3.4").host_port(),
            Some(("1.2.3.4", None))
        );
        assert_eq!(
            PeerUrl::new("tcp://[::1]:5432").host_port(),
            Some(("::1", Some("5432")))
        );
        assert_eq!(PeerUrl::new("http://1.2.3.4").host_port(), None);
    }
}
