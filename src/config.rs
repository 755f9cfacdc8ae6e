use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use network::{Directory, NodeId, PeerAddress};

use crate::error::{Result, StockMeshError};

/// Cluster file shared by every node. Only `node_id` differs between nodes,
/// and it is usually supplied on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node_id: NodeId,
    /// Node id to `host:port`.
    pub members: BTreeMap<NodeId, String>,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    #[serde(default = "default_election_confirm_timeout_ms")]
    pub election_confirm_timeout_ms: u64,
    /// Defaults to the lowest member id.
    #[serde(default)]
    pub initial_leader: Option<NodeId>,
    #[serde(default = "default_branch_capacity")]
    pub default_branch_capacity: u64,
    /// SQLite file, or `:memory:` for a volatile in-process store.
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_liveness_interval_ms() -> u64 {
    2000
}

fn default_election_confirm_timeout_ms() -> u64 {
    10_000
}

fn default_branch_capacity() -> u64 {
    storage::DEFAULT_BRANCH_CAPACITY
}

fn default_database() -> String {
    MEMORY_DATABASE.to_string()
}

pub const MEMORY_DATABASE: &str = ":memory:";

impl Config {
    pub fn new(node_id: NodeId, members: impl IntoIterator<Item = (NodeId, PeerAddress)>) -> Self {
        Self {
            node_id,
            members: members
                .into_iter()
                .map(|(id, addr)| (id, addr.to_string()))
                .collect(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            election_confirm_timeout_ms: default_election_confirm_timeout_ms(),
            initial_leader: None,
            default_branch_capacity: default_branch_capacity(),
            database: default_database(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StockMeshError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Checks that this node is a member, member ids are non-zero, and every
    /// address parses.
    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(StockMeshError::InvalidConfig("no members configured".to_string()));
        }
        if self.members.contains_key(&NodeId::OPERATOR) {
            return Err(StockMeshError::InvalidConfig(
                "node id 0 is reserved for operator clients".to_string(),
            ));
        }
        if !self.members.contains_key(&self.node_id) {
            return Err(StockMeshError::InvalidConfig(format!(
                "node {} is not listed in members",
                self.node_id
            )));
        }
        if let Some(leader) = self.initial_leader {
            if !self.members.contains_key(&leader) {
                return Err(StockMeshError::InvalidConfig(format!(
                    "initial leader {} is not listed in members",
                    leader
                )));
            }
        }
        if self.rpc_timeout_ms == 0 || self.liveness_interval_ms == 0 {
            return Err(StockMeshError::InvalidConfig(
                "timeouts and intervals must be positive".to_string(),
            ));
        }
        self.directory()?;
        Ok(())
    }

    pub fn directory(&self) -> Result<Directory> {
        let members = self
            .members
            .iter()
            .map(|(id, addr)| {
                addr.parse::<PeerAddress>()
                    .map(|addr| (*id, addr))
                    .map_err(|e| StockMeshError::InvalidConfig(format!("member {}: {}", id, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Directory::new(members))
    }

    pub fn initial_leader(&self) -> NodeId {
        self.initial_leader
            .or_else(|| self.members.keys().next().copied())
            .unwrap_or(self.node_id)
    }

    pub fn listen_address(&self) -> Result<PeerAddress> {
        let addr = self.members.get(&self.node_id).ok_or_else(|| {
            StockMeshError::InvalidConfig(format!("node {} has no address", self.node_id))
        })?;
        addr.parse::<PeerAddress>()
            .map_err(|e| StockMeshError::InvalidConfig(e.to_string()))
    }
}

impl From<Config> for network::Config {
    fn from(config: Config) -> Self {
        network::Config {
            node_id: config.node_id,
            rpc_timeout_ms: config.rpc_timeout_ms,
        }
    }
}

impl From<Config> for consensus::Config {
    fn from(config: Config) -> Self {
        consensus::Config {
            node_id: config.node_id,
            initial_leader: config.initial_leader(),
            liveness_interval_ms: config.liveness_interval_ms,
            election_confirm_timeout_ms: config.election_confirm_timeout_ms,
        }
    }
}
