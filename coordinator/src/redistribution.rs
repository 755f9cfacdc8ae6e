use std::sync::Arc;

use consensus::ConsensusManager;
use network::{allocations, Message, NodeId, Rebalance, RedistributeRequest, Transport};
use storage::InventoryStore;

use crate::planner::plan;
use crate::{forward, replicate, CoordinatorError, Result};

/// Moves an item's stock away from a branch that no longer answers onto the
/// others. Leader only, under the item's lock.
pub struct Redistributor<S> {
    node_id: NodeId,
    store: Arc<S>,
    transport: Transport,
    consensus: ConsensusManager,
}

impl<S: InventoryStore> Redistributor<S> {
    pub fn new(store: Arc<S>, transport: Transport, consensus: ConsensusManager) -> Self {
        Self {
            node_id: transport.local_id(),
            store,
            transport,
            consensus,
        }
    }

    pub async fn redistribute(&self, origin: NodeId, request: RedistributeRequest) -> Message {
        match self.consensus.remote_leader().await {
            Ok(None) => match self.rebalance(request).await {
                Ok(rebalance) => Message::Redistributed(rebalance),
                Err(e) => e.to_reply(),
            },
            Ok(Some(leader)) if origin == NodeId::OPERATOR => {
                forward(&self.transport, leader, Message::Redistribute(request)).await
            }
            Ok(Some(_)) => CoordinatorError::NotLeader(self.node_id).to_reply(),
            Err(e) => CoordinatorError::from(e).to_reply(),
        }
    }

    pub async fn rebalance(&self, request: RedistributeRequest) -> Result<Rebalance> {
        let RedistributeRequest { item_id, from_branch } = request;

        // A live branch keeps selling outside the item lock, so its stock
        // may only be moved once it has stopped answering.
        if self.transport.ping(from_branch).await {
            return Err(CoordinatorError::BranchReachable(from_branch));
        }

        if !self.consensus.acquire(item_id).await? {
            return Err(CoordinatorError::LockDenied(item_id));
        }

        let targets = self.transport.directory().peers_of(from_branch);
        let requester = self.node_id;
        let outcome = self
            .store
            .atomically(move |tx| -> Result<Rebalance> {
                if tx.item(item_id)?.is_none() {
                    return Err(CoordinatorError::ItemNotFound(item_id));
                }
                let moving = tx.branch_stock(item_id, from_branch)?.map(|s| s.qty).unwrap_or(0);

                let mut spaces = Vec::with_capacity(targets.len());
                for branch in &targets {
                    spaces.push((*branch, tx.capacity_available(*branch)?));
                }
                let shares = plan(moving, &spaces, requester);

                let mut result = std::collections::BTreeMap::new();
                tx.set_branch_stock(item_id, from_branch, 0)?;
                result.insert(from_branch, 0);
                for (branch, share) in shares {
                    let held = tx.branch_stock(item_id, branch)?.map(|s| s.qty).unwrap_or(0);
                    tx.set_branch_stock(item_id, branch, held + share)?;
                    result.insert(branch, held + share);
                }

                Ok(Rebalance {
                    item_id,
                    distribution: allocations(&result),
                })
            })
            .await;

        match self.consensus.release(item_id).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Lock on item {} was not held at release", item_id),
            Err(e) => tracing::warn!("Releasing lock on item {} failed: {}", item_id, e),
        }

        let rebalance = outcome?;
        tracing::info!(
            "Moved stock of item {} off branch {}: {:?}",
            item_id,
            from_branch,
            rebalance.distribution
        );

        replicate(&self.transport, Message::StockRebalanced(rebalance.clone()));
        Ok(rebalance)
    }
}
