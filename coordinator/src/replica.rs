use std::sync::Arc;

use network::{ArticleAnnouncement, InventoryUpdate, Rebalance};
use storage::{InventoryStore, NewSale};

use crate::Result;

/// Applies writes that other nodes committed and broadcast.
pub struct Replica<S> {
    store: Arc<S>,
}

impl<S: InventoryStore> Replica<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Records a peer's sale. Returns `false` when the shipment code is
    /// already known, so a re-delivered update changes nothing.
    pub async fn apply_inventory_update(&self, update: InventoryUpdate) -> Result<bool> {
        let applied = self
            .store
            .atomically(move |tx| -> Result<bool> {
                if tx.sale_exists(&update.shipment_code)? {
                    return Ok(false);
                }
                tx.set_branch_stock(update.item_id, update.branch_id, update.new_qty)?;
                tx.adjust_available(update.item_id, -(update.qty.min(i64::MAX as u64) as i64))?;
                tx.insert_sale(&NewSale {
                    item_id: update.item_id,
                    client_id: update.client_id,
                    branch_id: update.branch_id,
                    qty: update.qty,
                    shipment_code: update.shipment_code,
                    timestamp: update.timestamp,
                })?;
                Ok(true)
            })
            .await?;

        Ok(applied)
    }

    /// Mirrors a newly admitted article and its initial distribution. No
    /// capacity check is made here.
    pub async fn apply_new_article(&self, announcement: ArticleAnnouncement) -> Result<()> {
        let item_id = announcement.item.id;
        self.store
            .atomically(move |tx| -> Result<()> {
                tx.upsert_item(&announcement.item)?;
                for allocation in &announcement.distribution {
                    tx.set_branch_stock(announcement.item.id, allocation.branch_id, allocation.qty)?;
                }
                Ok(())
            })
            .await?;
        tracing::info!("Mirrored new article {}", item_id);
        Ok(())
    }

    pub async fn apply_stock_rebalanced(&self, rebalance: Rebalance) -> Result<()> {
        let item_id = rebalance.item_id;
        self.store
            .atomically(move |tx| -> Result<()> {
                for allocation in &rebalance.distribution {
                    tx.set_branch_stock(rebalance.item_id, allocation.branch_id, allocation.qty)?;
                }
                Ok(())
            })
            .await?;
        tracing::info!("Mirrored rebalanced stock of item {}", item_id);
        Ok(())
    }
}
