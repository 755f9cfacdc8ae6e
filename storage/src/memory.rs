use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::model::*;
use crate::store::{InventoryStore, StockTx};
use crate::{Result, StorageError, DEFAULT_BRANCH_CAPACITY};

/// In-process store. A unit of work runs directly against the tables while
/// journaling the previous value of everything it touches; an error replays
/// the journal backwards.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

#[derive(Debug, Default)]
struct Tables {
    items: BTreeMap<ItemId, InventoryItem>,
    stock: BTreeMap<(ItemId, NodeId), u64>,
    capacities: BTreeMap<NodeId, u64>,
    sales: Vec<SaleRecord>,
    clients: Vec<Client>,
    next_item_id: ItemId,
    next_sale_id: i64,
    next_client_id: i64,
    default_capacity: u64,
}

enum Undo {
    Item(ItemId, Option<InventoryItem>),
    Stock((ItemId, NodeId), Option<u64>),
    Capacity(NodeId, Option<u64>),
    PopSale,
    PopClient,
    Counters { item: ItemId, sale: i64, client: i64 },
}

struct MemoryTx<'a> {
    tables: &'a mut Tables,
    journal: Vec<Undo>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_default_capacity(DEFAULT_BRANCH_CAPACITY)
    }

    pub fn with_default_capacity(default_capacity: u64) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables {
                next_item_id: 1,
                next_sale_id: 1,
                next_client_id: 1,
                default_capacity,
                ..Tables::default()
            })),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn atomically<T, E, F>(&self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut dyn StockTx) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StorageError> + Send + 'static,
    {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| StorageError::Task("memory store mutex poisoned".to_string()))?;

        let mut tx = MemoryTx {
            tables: &mut *tables,
            journal: Vec::new(),
        };

        match work(&mut tx) {
            Ok(value) => Ok(value),
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }
}

impl MemoryTx<'_> {
    fn rollback(&mut self) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::Item(id, Some(item)) => {
                    self.tables.items.insert(id, item);
                }
                Undo::Item(id, None) => {
                    self.tables.items.remove(&id);
                }
                Undo::Stock(key, Some(qty)) => {
                    self.tables.stock.insert(key, qty);
                }
                Undo::Stock(key, None) => {
                    self.tables.stock.remove(&key);
                }
                Undo::Capacity(branch, Some(cap)) => {
                    self.tables.capacities.insert(branch, cap);
                }
                Undo::Capacity(branch, None) => {
                    self.tables.capacities.remove(&branch);
                }
                Undo::PopSale => {
                    self.tables.sales.pop();
                }
                Undo::PopClient => {
                    self.tables.clients.pop();
                }
                Undo::Counters { item, sale, client } => {
                    self.tables.next_item_id = item;
                    self.tables.next_sale_id = sale;
                    self.tables.next_client_id = client;
                }
            }
        }
    }

    fn save_counters(&mut self) {
        self.journal.push(Undo::Counters {
            item: self.tables.next_item_id,
            sale: self.tables.next_sale_id,
            client: self.tables.next_client_id,
        });
    }

    fn put_stock(&mut self, key: (ItemId, NodeId), qty: u64) {
        let previous = self.tables.stock.insert(key, qty);
        self.journal.push(Undo::Stock(key, previous));
    }

    fn put_item(&mut self, item: InventoryItem) {
        let previous = self.tables.items.insert(item.id, item.clone());
        self.journal.push(Undo::Item(item.id, previous));
    }

    fn capacity_of(&self, branch: NodeId) -> u64 {
        self.tables
            .capacities
            .get(&branch)
            .copied()
            .unwrap_or(self.tables.default_capacity)
    }

    fn held_at(&self, branch: NodeId) -> u64 {
        self.tables
            .stock
            .iter()
            .filter(|((_, b), _)| *b == branch)
            .map(|(_, qty)| *qty)
            .sum()
    }
}

impl StockTx for MemoryTx<'_> {
    fn item(&mut self, item: ItemId) -> Result<Option<InventoryItem>> {
        Ok(self.tables.items.get(&item).cloned())
    }

    fn branch_stock(&mut self, item: ItemId, branch: NodeId) -> Result<Option<BranchStock>> {
        let Some(qty) = self.tables.stock.get(&(item, branch)).copied() else {
            return Ok(None);
        };
        let capacity_max = self.capacity_of(branch);
        Ok(Some(BranchStock {
            item_id: item,
            branch_id: branch,
            qty,
            capacity_max,
            space_available: capacity_max as i64 - self.held_at(branch) as i64,
        }))
    }

    fn decrement_branch_stock(
        &mut self,
        item: ItemId,
        branch: NodeId,
        qty: u64,
        precondition_qty: u64,
    ) -> Result<u64> {
        let current = self
            .tables
            .stock
            .get(&(item, branch))
            .copied()
            .ok_or(StorageError::StockNotFound { item, branch })?;

        if current != precondition_qty {
            return Err(StorageError::PreconditionFailed {
                expected: precondition_qty,
                actual: current,
            });
        }
        let remaining = current.checked_sub(qty).ok_or(StorageError::Underflow(item))?;
        self.put_stock((item, branch), remaining);
        Ok(remaining)
    }

    fn adjust_available(&mut self, item: ItemId, delta: i64) -> Result<()> {
        let mut record = self
            .tables
            .items
            .get(&item)
            .cloned()
            .ok_or(StorageError::ItemNotFound(item))?;

        let adjusted = record.available_qty as i64 + delta;
        if adjusted < 0 {
            return Err(StorageError::Underflow(item));
        }
        record.available_qty = adjusted as u64;
        self.put_item(record);
        Ok(())
    }

    fn insert_item(&mut self, item: &NewItem) -> Result<InventoryItem> {
        self.save_counters();
        let id = self.tables.next_item_id;
        self.tables.next_item_id += 1;

        let record = InventoryItem {
            id,
            name: item.name.clone(),
            description: item.description.clone(),
            total_qty: item.quantity,
            available_qty: item.quantity,
        };
        self.put_item(record.clone());
        Ok(record)
    }

    fn upsert_item(&mut self, item: &InventoryItem) -> Result<()> {
        if item.id >= self.tables.next_item_id {
            self.save_counters();
            self.tables.next_item_id = item.id + 1;
        }
        self.put_item(item.clone());
        Ok(())
    }

    fn insert_branch_stock(&mut self, item: ItemId, branch: NodeId, qty: u64) -> Result<()> {
        if !self.tables.items.contains_key(&item) {
            return Err(StorageError::ItemNotFound(item));
        }
        if self.tables.stock.contains_key(&(item, branch)) {
            return Err(StorageError::Database(format!(
                "stock row for item {} at branch {} already exists",
                item, branch
            )));
        }
        self.put_stock((item, branch), qty);
        Ok(())
    }

    fn set_branch_stock(&mut self, item: ItemId, branch: NodeId, qty: u64) -> Result<()> {
        if !self.tables.items.contains_key(&item) {
            return Err(StorageError::ItemNotFound(item));
        }
        self.put_stock((item, branch), qty);
        Ok(())
    }

    fn insert_sale(&mut self, sale: &NewSale) -> Result<SaleRecord> {
        if self.sale_exists(&sale.shipment_code)? {
            return Err(StorageError::DuplicateShipment(sale.shipment_code.clone()));
        }
        self.save_counters();
        let id = self.tables.next_sale_id;
        self.tables.next_sale_id += 1;

        let record = SaleRecord {
            id,
            item_id: sale.item_id,
            client_id: sale.client_id,
            branch_id: sale.branch_id,
            qty: sale.qty,
            shipment_code: sale.shipment_code.clone(),
            timestamp: sale.timestamp,
        };
        self.tables.sales.push(record.clone());
        self.journal.push(Undo::PopSale);
        Ok(record)
    }

    fn sale_exists(&mut self, shipment_code: &str) -> Result<bool> {
        Ok(self
            .tables
            .sales
            .iter()
            .any(|sale| sale.shipment_code == shipment_code))
    }

    fn capacity_available(&mut self, branch: NodeId) -> Result<i64> {
        Ok(self.capacity_of(branch) as i64 - self.held_at(branch) as i64)
    }

    fn set_capacity(&mut self, branch: NodeId, capacity_max: u64) -> Result<()> {
        let previous = self.tables.capacities.insert(branch, capacity_max);
        self.journal.push(Undo::Capacity(branch, previous));
        Ok(())
    }

    fn branch_inventory(&mut self, branch: NodeId) -> Result<Vec<StockLine>> {
        Ok(self
            .tables
            .stock
            .iter()
            .filter(|((_, b), _)| *b == branch)
            .filter_map(|((item_id, _), qty)| {
                self.tables.items.get(item_id).map(|item| StockLine {
                    item_id: *item_id,
                    name: item.name.clone(),
                    description: item.description.clone(),
                    branch_qty: *qty,
                    total_qty: item.total_qty,
                })
            })
            .collect())
    }

    fn sales(&mut self) -> Result<Vec<SaleRecord>> {
        Ok(self.tables.sales.clone())
    }

    fn clients(&mut self) -> Result<Vec<Client>> {
        Ok(self.tables.clients.clone())
    }

    fn insert_client(&mut self, client: &NewClient) -> Result<Client> {
        self.save_counters();
        let id = self.tables.next_client_id;
        self.tables.next_client_id += 1;

        let record = Client {
            id,
            name: client.name.clone(),
            address: client.address.clone(),
            phone: client.phone.clone(),
            email: client.email.clone(),
            home_branch: client.home_branch,
        };
        self.tables.clients.push(record.clone());
        self.journal.push(Undo::PopClient);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn widget() -> NewItem {
        NewItem {
            name: "widget".to_string(),
            description: "a widget".to_string(),
            quantity: 10,
        }
    }

    #[tokio::test]
    async fn failed_unit_leaves_no_trace() {
        let store = MemoryStore::new();
        let item = store
            .atomically(|tx| {
                let item = tx.insert_item(&widget())?;
                tx.insert_branch_stock(item.id, NodeId(1), 4)?;
                Ok::<_, StorageError>(item)
            })
            .await
            .unwrap();

        let result: Result<()> = store
            .atomically(move |tx| {
                tx.decrement_branch_stock(item.id, NodeId(1), 3, 4)?;
                tx.adjust_available(item.id, -3)?;
                tx.insert_item(&widget())?;
                Err(StorageError::Database("injected".to_string()))
            })
            .await;
        assert!(result.is_err());

        let stock = store.branch_stock(item.id, NodeId(1)).await.unwrap().unwrap();
        assert_eq!(stock.qty, 4);
        assert_eq!(store.item(item.id).await.unwrap().unwrap().available_qty, 10);
        assert!(store.item(item.id + 1).await.unwrap().is_none());

        // The id counter was rolled back too.
        let next = store.atomically(|tx| tx.insert_item(&widget())).await.unwrap();
        assert_eq!(next.id, item.id + 1);
    }

    #[tokio::test]
    async fn decrement_checks_precondition() {
        let store = MemoryStore::new();
        let item = store
            .atomically(|tx| {
                let item = tx.insert_item(&widget())?;
                tx.insert_branch_stock(item.id, NodeId(2), 5)?;
                Ok::<_, StorageError>(item)
            })
            .await
            .unwrap();

        let stale = store
            .atomically(move |tx| tx.decrement_branch_stock(item.id, NodeId(2), 1, 7))
            .await;
        assert!(matches!(
            stale,
            Err(StorageError::PreconditionFailed { expected: 7, actual: 5 })
        ));
    }

    #[tokio::test]
    async fn shipment_codes_are_unique() {
        let store = MemoryStore::new();
        let sale = NewSale {
            item_id: 1,
            client_id: 1,
            branch_id: NodeId(1),
            qty: 1,
            shipment_code: "ABC".to_string(),
            timestamp: Utc::now(),
        };
        let first = sale.clone();
        store.atomically(move |tx| tx.insert_sale(&first)).await.unwrap();
        let second = store.atomically(move |tx| tx.insert_sale(&sale)).await;
        assert!(matches!(second, Err(StorageError::DuplicateShipment(_))));
        assert_eq!(store.sales().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn capacity_available_subtracts_held_stock() {
        let store = MemoryStore::with_default_capacity(50);
        store.set_capacity(NodeId(2), 30).await.unwrap();
        store
            .atomically(|tx| {
                let a = tx.insert_item(&widget())?;
                tx.insert_branch_stock(a.id, NodeId(1), 20)?;
                tx.insert_branch_stock(a.id, NodeId(2), 35)?;
                Ok::<_, StorageError>(())
            })
            .await
            .unwrap();

        assert_eq!(store.capacity_available(NodeId(1)).await.unwrap(), 30);
        assert_eq!(store.capacity_available(NodeId(2)).await.unwrap(), -5);
        assert_eq!(store.capacity_available(NodeId(3)).await.unwrap(), 50);
    }
}
