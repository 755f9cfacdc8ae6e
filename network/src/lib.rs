mod codec;
mod directory;
mod messages;
mod server;
mod transport;

pub use directory::{Directory, PeerAddress};
pub use messages::*;
pub use server::{EnvelopeHandler, RpcServer};
pub use transport::Transport;

pub use storage::NodeId;

use std::time::Duration;

/// Version stamped on every envelope. Peers answer any other value with a
/// protocol error.
pub const PROTOCOL_VERSION: u16 = 1;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    pub rpc_timeout_ms: u64,
}

impl Config {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
