mod ingestion;
mod planner;
mod redistribution;
mod replica;
mod sale;

pub use ingestion::IngestionCoordinator;
pub use planner::plan;
pub use redistribution::Redistributor;
pub use replica::Replica;
pub use sale::{shipment_code, SaleCoordinator, SHIPMENT_CODE_LEN};

use consensus::ConsensusError;
use network::{ErrorKind, Message, NodeId, Transport};
use storage::{ItemId, StorageError};

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Insufficient stock for item {item} at branch {branch}: {available} available, {requested} requested")]
    InsufficientStock {
        item: ItemId,
        branch: NodeId,
        available: u64,
        requested: u64,
    },

    #[error("Item {item} is not stocked at branch {branch}")]
    NotStocked { item: ItemId, branch: NodeId },

    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(u64),

    #[error("Lock on item {0} is held by another node")]
    LockDenied(ItemId),

    #[error("Node {0} is not the leader")]
    NotLeader(NodeId),

    #[error("Branch {0} is still reachable")]
    BranchReachable(NodeId),

    #[error("Leader {0} is unreachable")]
    LeaderUnreachable(NodeId),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::InsufficientStock { .. }
            | CoordinatorError::NotStocked { .. }
            | CoordinatorError::ItemNotFound(_)
            | CoordinatorError::InvalidQuantity(_)
            | CoordinatorError::LockDenied(_)
            | CoordinatorError::BranchReachable(_)
            | CoordinatorError::NotLeader(_)
            | CoordinatorError::Consensus(ConsensusError::NoLeader)
            | CoordinatorError::Consensus(ConsensusError::NotLeader(_))
            | CoordinatorError::Consensus(ConsensusError::Rejected(_)) => ErrorKind::Business,
            CoordinatorError::LeaderUnreachable(_) | CoordinatorError::Consensus(_) => ErrorKind::Network,
            CoordinatorError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// The failure as a reply envelope.
    pub fn to_reply(&self) -> Message {
        Message::error(self.kind(), self.to_string())
    }
}

/// Sends `message` to every peer in the background. Failures are logged and
/// nothing is retried.
pub(crate) fn replicate(transport: &Transport, message: Message) {
    let transport = transport.clone();
    tokio::spawn(async move {
        let tag = message.tag();
        for (peer, reply) in transport.broadcast(message).await {
            match reply {
                None => tracing::warn!("Replicating {} to node {} failed: no reply", tag, peer),
                Some(Message::Error(e)) => {
                    tracing::warn!("Node {} rejected replicated {}: {}", peer, tag, e)
                }
                Some(_) => tracing::debug!("Node {} applied replicated {}", peer, tag),
            }
        }
    });
}

/// Relays a leader-only request to the leader and hands back its reply as-is.
pub(crate) async fn forward(transport: &Transport, leader: NodeId, message: Message) -> Message {
    tracing::info!("Forwarding {} to leader {}", message.tag(), leader);
    match transport.send(leader, message).await {
        Some(reply) => reply,
        None => CoordinatorError::LeaderUnreachable(leader).to_reply(),
    }
}
