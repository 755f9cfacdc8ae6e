mod model;
mod store;
mod memory;
mod sqlite;

pub use model::{
    Client, InventoryItem, ItemId, NewClient, NewItem, NewSale, NodeId, SaleRecord, StockLine,
    BranchStock,
};
pub use store::{InventoryStore, StockTx};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Capacity assumed for a branch that has never been given an explicit one.
pub const DEFAULT_BRANCH_CAPACITY: u64 = 100;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("No stock row for item {item} at branch {branch}")]
    StockNotFound { item: ItemId, branch: NodeId },

    #[error("Precondition failed: expected {expected} units, found {actual}")]
    PreconditionFailed { expected: u64, actual: u64 },

    #[error("Quantity underflow on item {0}")]
    Underflow(ItemId),

    #[error("Duplicate shipment code: {0}")]
    DuplicateShipment(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Backend task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}
