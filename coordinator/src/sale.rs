use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use network::{InventoryUpdate, Message, NodeId, SaleReceipt, SaleRequest, Transport};
use storage::{InventoryStore, ItemId, NewSale};

use crate::{replicate, CoordinatorError, Result};

pub const SHIPMENT_CODE_LEN: usize = 20;

/// Disambiguates codes minted within the same clock tick.
static SHIPMENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Uppercase hex prefix of `sha256(item-branch-client-nanos-sequence)`.
pub fn shipment_code(item: ItemId, branch: NodeId, client: i64, nanos: i64, sequence: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}-{}-{}-{}-{}", item, branch, client, nanos, sequence).as_bytes());
    let digest = hasher.finalize();

    let mut code: String = digest.iter().map(|byte| format!("{:02X}", byte)).collect();
    code.truncate(SHIPMENT_CODE_LEN);
    code
}

/// Sells stock held by this branch.
///
/// The read-check-write runs under one branch-wide mutex and commits as a
/// single storage unit. Peers learn about the sale afterwards through a
/// best-effort `inventory-update` broadcast that is never awaited.
pub struct SaleCoordinator<S> {
    branch: NodeId,
    store: Arc<S>,
    transport: Transport,
    critical: Mutex<()>,
}

impl<S: InventoryStore> SaleCoordinator<S> {
    pub fn new(store: Arc<S>, transport: Transport) -> Self {
        Self {
            branch: transport.local_id(),
            store,
            transport,
            critical: Mutex::new(()),
        }
    }

    pub async fn sell(&self, request: SaleRequest) -> Result<SaleReceipt> {
        let SaleRequest { item_id, client_id, qty } = request;
        let branch = self.branch;
        let delta = i64::try_from(qty)
            .ok()
            .filter(|q| *q > 0)
            .ok_or(CoordinatorError::InvalidQuantity(qty))?;

        let receipt = {
            let _guard = self.critical.lock().await;

            let now = Utc::now();
            let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1_000);
            let code = shipment_code(
                item_id,
                branch,
                client_id,
                nanos,
                SHIPMENT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            );

            self.store
                .atomically(move |tx| -> Result<SaleReceipt> {
                    let stock = tx
                        .branch_stock(item_id, branch)?
                        .ok_or(CoordinatorError::NotStocked { item: item_id, branch })?;
                    if stock.qty < qty {
                        return Err(CoordinatorError::InsufficientStock {
                            item: item_id,
                            branch,
                            available: stock.qty,
                            requested: qty,
                        });
                    }

                    let remaining_qty = tx.decrement_branch_stock(item_id, branch, qty, stock.qty)?;
                    tx.adjust_available(item_id, -delta)?;
                    let sale = tx.insert_sale(&NewSale {
                        item_id,
                        client_id,
                        branch_id: branch,
                        qty,
                        shipment_code: code,
                        timestamp: now,
                    })?;

                    Ok(SaleReceipt { sale, remaining_qty })
                })
                .await
        };

        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::info!("Sale of {} x item {} at branch {} refused: {}", qty, item_id, branch, e);
                return Err(e);
            }
        };

        tracing::info!(
            "Branch {} sold {} x item {} to client {} (shipment {}, {} left)",
            branch,
            qty,
            item_id,
            client_id,
            receipt.sale.shipment_code,
            receipt.remaining_qty
        );

        replicate(
            &self.transport,
            Message::InventoryUpdate(InventoryUpdate {
                item_id,
                branch_id: branch,
                new_qty: receipt.remaining_qty,
                qty,
                client_id,
                shipment_code: receipt.sale.shipment_code.clone(),
                timestamp: receipt.sale.timestamp,
            }),
        );

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_are_fixed_length_uppercase_hex() {
        let code = shipment_code(1, NodeId(2), 3, 1_700_000_000_000_000_000, 0);
        assert_eq!(code.len(), SHIPMENT_CODE_LEN);
        assert!(code.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    #[test]
    fn same_instant_differs_by_sequence() {
        let a = shipment_code(1, NodeId(2), 3, 42, 0);
        let b = shipment_code(1, NodeId(2), 3, 42, 1);
        assert_ne!(a, b);
        assert_eq!(a, shipment_code(1, NodeId(2), 3, 42, 0));
    }

    #[test]
    fn ten_thousand_codes_are_distinct() {
        let codes: HashSet<String> = (0..10_000u64)
            .map(|i| shipment_code(7, NodeId(1), 9, 1_000 + (i / 4) as i64, i))
            .collect();
        assert_eq!(codes.len(), 10_000);
    }
}
