mod election;
mod locks;
mod manager;

pub use election::{BullyElection, ElectionState};
pub use locks::LockTable;
pub use manager::ConsensusManager;

pub use network::Role;

use network::{NetworkError, NodeId};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    /// Leader every node assumes at startup until proven unreachable.
    pub initial_leader: NodeId,
    pub liveness_interval_ms: u64,
    /// How long a deferring candidate waits for `leader-confirmed` before it
    /// gives up and lets the liveness monitor try again.
    pub election_confirm_timeout_ms: u64,
}

impl Config {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn election_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.election_confirm_timeout_ms)
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("No leader is known")]
    NoLeader,

    #[error("Leader {0} did not answer")]
    LeaderUnreachable(NodeId),

    #[error("Node {0} is not the leader")]
    NotLeader(NodeId),

    #[error("Leader rejected the request: {0}")]
    Rejected(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}
