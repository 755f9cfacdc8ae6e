use async_trait::async_trait;

use crate::model::*;
use crate::{Result, StorageError};

/// Row-level primitives available inside one atomic unit of work.
///
/// Every call either succeeds or returns an error; the enclosing
/// [`InventoryStore::atomically`] decides whether the unit commits.
pub trait StockTx {
    fn item(&mut self, item: ItemId) -> Result<Option<InventoryItem>>;

    fn branch_stock(&mut self, item: ItemId, branch: NodeId) -> Result<Option<BranchStock>>;

    /// Removes `qty` units from a branch row whose current quantity must equal
    /// `precondition_qty`. Returns the new quantity.
    fn decrement_branch_stock(
        &mut self,
        item: ItemId,
        branch: NodeId,
        qty: u64,
        precondition_qty: u64,
    ) -> Result<u64>;

    /// Shifts an item's `available_qty` by `delta`, refusing to go below zero.
    fn adjust_available(&mut self, item: ItemId, delta: i64) -> Result<()>;

    fn insert_item(&mut self, item: &NewItem) -> Result<InventoryItem>;

    /// Inserts or replaces an item under its existing id (replica path).
    fn upsert_item(&mut self, item: &InventoryItem) -> Result<()>;

    fn insert_branch_stock(&mut self, item: ItemId, branch: NodeId, qty: u64) -> Result<()>;

    /// Inserts or overwrites a branch row (replica and rebalance path).
    fn set_branch_stock(&mut self, item: ItemId, branch: NodeId, qty: u64) -> Result<()>;

    fn insert_sale(&mut self, sale: &NewSale) -> Result<SaleRecord>;

    fn sale_exists(&mut self, shipment_code: &str) -> Result<bool>;

    /// `capacity_max - Σ qty` over everything the branch currently holds.
    fn capacity_available(&mut self, branch: NodeId) -> Result<i64>;

    fn set_capacity(&mut self, branch: NodeId, capacity_max: u64) -> Result<()>;

    fn branch_inventory(&mut self, branch: NodeId) -> Result<Vec<StockLine>>;

    fn sales(&mut self) -> Result<Vec<SaleRecord>>;

    fn clients(&mut self) -> Result<Vec<Client>>;

    fn insert_client(&mut self, client: &NewClient) -> Result<Client>;
}

/// Storage collaborator. Owns the durable inventory, sales and customer records.
#[async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    /// Runs `work` as one all-or-nothing unit: its effects become visible only
    /// if it returns `Ok`, and any error rolls back every change it made.
    async fn atomically<T, E, F>(&self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut dyn StockTx) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StorageError> + Send + 'static;

    async fn item(&self, item: ItemId) -> Result<Option<InventoryItem>> {
        self.atomically(move |tx| tx.item(item)).await
    }

    async fn branch_stock(&self, item: ItemId, branch: NodeId) -> Result<Option<BranchStock>> {
        self.atomically(move |tx| tx.branch_stock(item, branch)).await
    }

    async fn capacity_available(&self, branch: NodeId) -> Result<i64> {
        self.atomically(move |tx| tx.capacity_available(branch)).await
    }

    async fn set_capacity(&self, branch: NodeId, capacity_max: u64) -> Result<()> {
        self.atomically(move |tx| tx.set_capacity(branch, capacity_max)).await
    }

    async fn branch_inventory(&self, branch: NodeId) -> Result<Vec<StockLine>> {
        self.atomically(move |tx| tx.branch_inventory(branch)).await
    }

    async fn sales(&self) -> Result<Vec<SaleRecord>> {
        self.atomically(|tx| tx.sales()).await
    }

    async fn clients(&self) -> Result<Vec<Client>> {
        self.atomically(|tx| tx.clients()).await
    }

    async fn register_client(&self, client: NewClient) -> Result<Client> {
        self.atomically(move |tx| tx.insert_client(&client)).await
    }
}
