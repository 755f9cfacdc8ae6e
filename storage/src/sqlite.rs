//! SQLite-backed inventory store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library is
//! required. Each unit of work runs inside one SQLite transaction on a
//! blocking thread; dropping the transaction without committing rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

use crate::model::*;
use crate::store::{InventoryStore, StockTx};
use crate::{Result, StorageError, DEFAULT_BRANCH_CAPACITY};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    default_capacity: u64,
}

struct SqliteTx<'a> {
    conn: &'a Connection,
    default_capacity: u64,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_capacity(path, DEFAULT_BRANCH_CAPACITY)
    }

    pub fn open_with_capacity(path: &str, default_capacity: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS items (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                name           TEXT NOT NULL,
                description    TEXT NOT NULL DEFAULT '',
                total_qty      INTEGER NOT NULL,
                available_qty  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS branch_stock (
                item_id    INTEGER NOT NULL REFERENCES items(id),
                branch_id  INTEGER NOT NULL,
                qty        INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (item_id, branch_id)
            );

            CREATE INDEX IF NOT EXISTS idx_branch_stock_branch
                ON branch_stock(branch_id);

            CREATE TABLE IF NOT EXISTS branches (
                branch_id     INTEGER PRIMARY KEY,
                capacity_max  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS clients (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                name         TEXT NOT NULL,
                address      TEXT NOT NULL,
                phone        TEXT,
                email        TEXT,
                home_branch  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sales (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id        INTEGER NOT NULL REFERENCES items(id),
                client_id      INTEGER NOT NULL,
                branch_id      INTEGER NOT NULL,
                qty            INTEGER NOT NULL,
                shipment_code  TEXT NOT NULL UNIQUE,
                sold_at        TEXT NOT NULL
            );
            ",
        )?;

        tracing::info!("Opened inventory database at {}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            default_capacity,
        })
    }
}

#[async_trait]
impl InventoryStore for SqliteStore {
    async fn atomically<T, E, F>(&self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut dyn StockTx) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let default_capacity = self.default_capacity;

        tokio::task::spawn_blocking(move || -> std::result::Result<T, E> {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Task("sqlite connection mutex poisoned".to_string()))?;
            let tx = guard.transaction().map_err(StorageError::from)?;

            let value = {
                let mut handle = SqliteTx {
                    conn: &tx,
                    default_capacity,
                };
                work(&mut handle)?
            };

            tx.commit().map_err(StorageError::from)?;
            Ok(value)
        })
        .await
        .map_err(|e| E::from(StorageError::Task(e.to_string())))?
    }
}

fn to_sql_qty(qty: u64) -> i64 {
    qty.min(i64::MAX as u64) as i64
}

fn from_sql_qty(raw: i64) -> u64 {
    raw.max(0) as u64
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<InventoryItem> {
    Ok(InventoryItem {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        total_qty: from_sql_qty(row.get(3)?),
        available_qty: from_sql_qty(row.get(4)?),
    })
}

fn sale_from_row(row: &Row<'_>) -> rusqlite::Result<SaleRecord> {
    let sold_at: String = row.get(6)?;
    let timestamp = DateTime::parse_from_rfc3339(&sold_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(SaleRecord {
        id: row.get(0)?,
        item_id: row.get(1)?,
        client_id: row.get(2)?,
        branch_id: NodeId(row.get(3)?),
        qty: from_sql_qty(row.get(4)?),
        shipment_code: row.get(5)?,
        timestamp,
    })
}

impl SqliteTx<'_> {
    fn capacity_of(&self, branch: NodeId) -> Result<u64> {
        let capacity: Option<i64> = self
            .conn
            .query_row(
                "SELECT capacity_max FROM branches WHERE branch_id = ?1",
                params![branch.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(capacity.map(from_sql_qty).unwrap_or(self.default_capacity))
    }

    fn held_at(&self, branch: NodeId) -> Result<u64> {
        let held: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(qty), 0) FROM branch_stock WHERE branch_id = ?1",
            params![branch.0],
            |row| row.get(0),
        )?;
        Ok(from_sql_qty(held))
    }

    fn require_item(&self, item: ItemId) -> Result<()> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT id FROM items WHERE id = ?1", params![item], |row| row.get(0))
            .optional()?;
        exists.map(|_| ()).ok_or(StorageError::ItemNotFound(item))
    }
}

impl StockTx for SqliteTx<'_> {
    fn item(&mut self, item: ItemId) -> Result<Option<InventoryItem>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, description, total_qty, available_qty FROM items WHERE id = ?1",
                params![item],
                item_from_row,
            )
            .optional()?)
    }

    fn branch_stock(&mut self, item: ItemId, branch: NodeId) -> Result<Option<BranchStock>> {
        let qty: Option<i64> = self
            .conn
            .query_row(
                "SELECT qty FROM branch_stock WHERE item_id = ?1 AND branch_id = ?2",
                params![item, branch.0],
                |row| row.get(0),
            )
            .optional()?;

        let Some(qty) = qty else {
            return Ok(None);
        };
        let capacity_max = self.capacity_of(branch)?;
        let held = self.held_at(branch)?;
        Ok(Some(BranchStock {
            item_id: item,
            branch_id: branch,
            qty: from_sql_qty(qty),
            capacity_max,
            space_available: capacity_max as i64 - held as i64,
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
            .branch_stock(item, branch)?
            .ok_or(StorageError::StockNotFound { item, branch })?
            .qty;
        if current != precondition_qty {
            return Err(StorageError::PreconditionFailed {
                expected: precondition_qty,
                actual: current,
            });
        }
        let remaining = current.checked_sub(qty).ok_or(StorageError::Underflow(item))?;

        let changed = self.conn.execute(
            "UPDATE branch_stock SET qty = ?1, updated_at = ?2
             WHERE item_id = ?3 AND branch_id = ?4 AND qty = ?5",
            params![
                to_sql_qty(remaining),
                Utc::now().to_rfc3339(),
                item,
                branch.0,
                to_sql_qty(precondition_qty)
            ],
        )?;
        if changed != 1 {
            return Err(StorageError::PreconditionFailed {
                expected: precondition_qty,
                actual: current,
            });
        }
        Ok(remaining)
    }

    fn adjust_available(&mut self, item: ItemId, delta: i64) -> Result<()> {
        let record = self.item(item)?.ok_or(StorageError::ItemNotFound(item))?;
        let adjusted = record.available_qty as i64 + delta;
        if adjusted < 0 {
            return Err(StorageError::Underflow(item));
        }
        self.conn.execute(
            "UPDATE items SET available_qty = ?1 WHERE id = ?2",
            params![adjusted, item],
        )?;
        Ok(())
    }

    fn insert_item(&mut self, item: &NewItem) -> Result<InventoryItem> {
        self.conn.execute(
            "INSERT INTO items (name, description, total_qty, available_qty)
             VALUES (?1, ?2, ?3, ?3)",
            params![item.name, item.description, to_sql_qty(item.quantity)],
        )?;
        Ok(InventoryItem {
            id: self.conn.last_insert_rowid(),
            name: item.name.clone(),
            description: item.description.clone(),
            total_qty: item.quantity,
            available_qty: item.quantity,
        })
    }

    fn upsert_item(&mut self, item: &InventoryItem) -> Result<()> {
        self.conn.execute(
            "INSERT INTO items (id, name, description, total_qty, available_qty)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                total_qty = excluded.total_qty,
                available_qty = excluded.available_qty",
            params![
                item.id,
                item.name,
                item.description,
                to_sql_qty(item.total_qty),
                to_sql_qty(item.available_qty)
            ],
        )?;
        Ok(())
    }

    fn insert_branch_stock(&mut self, item: ItemId, branch: NodeId, qty: u64) -> Result<()> {
        self.require_item(item)?;
        self.conn.execute(
            "INSERT INTO branch_stock (item_id, branch_id, qty, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![item, branch.0, to_sql_qty(qty), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn set_branch_stock(&mut self, item: ItemId, branch: NodeId, qty: u64) -> Result<()> {
        self.require_item(item)?;
        self.conn.execute(
            "INSERT INTO branch_stock (item_id, branch_id, qty, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(item_id, branch_id) DO UPDATE SET
                qty = excluded.qty,
                updated_at = excluded.updated_at",
            params![item, branch.0, to_sql_qty(qty), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn insert_sale(&mut self, sale: &NewSale) -> Result<SaleRecord> {
        let inserted = self.conn.execute(
            "INSERT INTO sales (item_id, client_id, branch_id, qty, shipment_code, sold_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sale.item_id,
                sale.client_id,
                sale.branch_id.0,
                to_sql_qty(sale.qty),
                sale.shipment_code,
                sale.timestamp.to_rfc3339()
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
                    && self.sale_exists(&sale.shipment_code)? =>
            {
                return Err(StorageError::DuplicateShipment(sale.shipment_code.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(SaleRecord {
            id: self.conn.last_insert_rowid(),
            item_id: sale.item_id,
            client_id: sale.client_id,
            branch_id: sale.branch_id,
            qty: sale.qty,
            shipment_code: sale.shipment_code.clone(),
            timestamp: sale.timestamp,
        })
    }

    fn sale_exists(&mut self, shipment_code: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM sales WHERE shipment_code = ?1",
                params![shipment_code],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn capacity_available(&mut self, branch: NodeId) -> Result<i64> {
        Ok(self.capacity_of(branch)? as i64 - self.held_at(branch)? as i64)
    }

    fn set_capacity(&mut self, branch: NodeId, capacity_max: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO branches (branch_id, capacity_max) VALUES (?1, ?2)
             ON CONFLICT(branch_id) DO UPDATE SET capacity_max = excluded.capacity_max",
            params![branch.0, to_sql_qty(capacity_max)],
        )?;
        Ok(())
    }

    fn branch_inventory(&mut self, branch: NodeId) -> Result<Vec<StockLine>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.id, i.name, i.description, s.qty, i.total_qty
             FROM items i
             JOIN branch_stock s ON i.id = s.item_id
             WHERE s.branch_id = ?1
             ORDER BY i.id",
        )?;
        let rows = stmt.query_map(params![branch.0], |row| {
            Ok(StockLine {
                item_id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                branch_qty: from_sql_qty(row.get(3)?),
                total_qty: from_sql_qty(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn sales(&mut self) -> Result<Vec<SaleRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_id, client_id, branch_id, qty, shipment_code, sold_at
             FROM sales ORDER BY id",
        )?;
        let rows = stmt.query_map([], sale_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn clients(&mut self) -> Result<Vec<Client>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, address, phone, email, home_branch FROM clients ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Client {
                id: row.get(0)?,
                name: row.get(1)?,
                address: row.get(2)?,
                phone: row.get(3)?,
                email: row.get(4)?,
                home_branch: NodeId(row.get(5)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn insert_client(&mut self, client: &NewClient) -> Result<Client> {
        self.conn.execute(
            "INSERT INTO clients (name, address, phone, email, home_branch)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                client.name,
                client.address,
                client.phone,
                client.email,
                client.home_branch.0
            ],
        )?;
        Ok(Client {
            id: self.conn.last_insert_rowid(),
            name: client.name.clone(),
            address: client.address.clone(),
            phone: client.phone.clone(),
            email: client.email.clone(),
            home_branch: client.home_branch,
        })
    }
}
