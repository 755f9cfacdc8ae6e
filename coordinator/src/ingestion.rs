use std::sync::Arc;

use consensus::ConsensusManager;
use network::{allocations, ArticleAnnouncement, Message, NodeId, Transport};
use storage::{InventoryStore, NewItem};

use crate::planner::plan;
use crate::{forward, replicate, CoordinatorError, Result};

/// Admits new articles. Only the leader writes them; other nodes relay the
/// request one hop to the leader.
pub struct IngestionCoordinator<S> {
    node_id: NodeId,
    store: Arc<S>,
    transport: Transport,
    consensus: ConsensusManager,
}

impl<S: InventoryStore> IngestionCoordinator<S> {
    pub fn new(store: Arc<S>, transport: Transport, consensus: ConsensusManager) -> Self {
        Self {
            node_id: transport.local_id(),
            store,
            transport,
            consensus,
        }
    }

    /// Handles `add-article` from `origin`. Operator requests reaching a
    /// follower are forwarded and the leader's reply is returned unchanged;
    /// a follower never re-forwards a request another node relayed.
    pub async fn add_article(&self, origin: NodeId, item: NewItem) -> Message {
        match self.consensus.remote_leader().await {
            Ok(None) => match self.admit(item).await {
                Ok(announcement) => Message::ArticleAdded(announcement),
                Err(e) => e.to_reply(),
            },
            Ok(Some(leader)) if origin == NodeId::OPERATOR => {
                forward(&self.transport, leader, Message::AddArticle(item)).await
            }
            Ok(Some(_)) => CoordinatorError::NotLeader(self.node_id).to_reply(),
            Err(e) => CoordinatorError::from(e).to_reply(),
        }
    }

    /// Leader side: inserts the item, spreads its quantity across every
    /// member by free capacity, and commits both in one unit. Peers are told
    /// afterwards with a `new-article` broadcast.
    pub async fn admit(&self, item: NewItem) -> Result<ArticleAnnouncement> {
        let members: Vec<NodeId> = self.transport.directory().ids().collect();
        let requester = self.node_id;

        let announcement = self
            .store
            .atomically(move |tx| -> Result<ArticleAnnouncement> {
                let mut spaces = Vec::with_capacity(members.len());
                for branch in &members {
                    spaces.push((*branch, tx.capacity_available(*branch)?));
                }

                let record = tx.insert_item(&item)?;
                let distribution = plan(item.quantity, &spaces, requester);
                for (branch, qty) in &distribution {
                    tx.insert_branch_stock(record.id, *branch, *qty)?;
                }

                Ok(ArticleAnnouncement {
                    item: record,
                    distribution: allocations(&distribution),
                })
            })
            .await?;

        tracing::info!(
            "Admitted article {} ({}) with {} units: {:?}",
            announcement.item.id,
            announcement.item.name,
            announcement.item.total_qty,
            announcement.distribution
        );

        replicate(&self.transport, Message::NewArticle(announcement.clone()));
        Ok(announcement)
    }
}
