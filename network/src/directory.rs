use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{NetworkError, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NetworkError::Protocol(format!("address '{}' is not host:port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| NetworkError::Protocol(format!("bad port in '{}': {}", s, e)))?;
        if host.is_empty() {
            return Err(NetworkError::Protocol(format!("address '{}' has no host", s)));
        }
        Ok(Self::new(host, port))
    }
}

/// Static membership: every node id the cluster will ever have and where it
/// listens. Fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    members: BTreeMap<NodeId, PeerAddress>,
}

impl Directory {
    pub fn new(members: impl IntoIterator<Item = (NodeId, PeerAddress)>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn address(&self, id: NodeId) -> Option<&PeerAddress> {
        self.members.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    /// All member ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    pub fn members(&self) -> impl Iterator<Item = (NodeId, &PeerAddress)> + '_ {
        self.members.iter().map(|(id, addr)| (*id, addr))
    }

    /// Everyone except `id`.
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.ids().filter(|peer| *peer != id).collect()
    }

    /// Members whose id is strictly greater than `id`.
    pub fn higher_than(&self, id: NodeId) -> Vec<NodeId> {
        self.members
            .range(NodeId(id.0.saturating_add(1))..)
            .map(|(peer, _)| *peer)
            .filter(|peer| *peer > id)
            .collect()
    }

    pub fn lowest(&self) -> Option<NodeId> {
        self.ids().next()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
