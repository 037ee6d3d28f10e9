//! Database module for SQLite operations using SQLx
//! Uses runtime query checking (no compile-time DATABASE_URL needed)
//!
//! Reads go straight to the pool and only ever see committed rows. Every
//! write goes through [`Database::begin_write`], which serializes writers
//! behind a single mutex and wraps them in one SQL transaction.

mod models;

pub use models::*;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{FromRow, Sqlite, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Record not found")]
    NotFound,
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS purchase_objects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        quantity REAL NOT NULL,
        value REAL NOT NULL DEFAULT 0,
        buy_price REAL NOT NULL DEFAULT 0,
        sell_price REAL NOT NULL DEFAULT 0,
        min_appreciation REAL NOT NULL,
        validity_days INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS holdings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        object_id INTEGER NOT NULL REFERENCES purchase_objects(id),
        quantity REAL NOT NULL,
        purchase_price REAL NOT NULL,
        purchase_date TEXT NOT NULL,
        sale_price REAL,
        sale_date TEXT,
        purchase_order_id TEXT NOT NULL,
        sale_order_id TEXT DEFAULT NULL,
        status TEXT NOT NULL CHECK (status IN ('Open', 'Sold', 'Cancelled')),
        created_date TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS operations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        holding_id INTEGER NOT NULL REFERENCES holdings(id),
        action TEXT NOT NULL CHECK (action IN ('buy', 'sell')),
        quantity REAL NOT NULL,
        price REAL NOT NULL,
        gain REAL NOT NULL DEFAULT 0,
        date TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_holdings_status ON holdings(status, purchase_date)",
    "CREATE INDEX IF NOT EXISTS idx_operations_holding ON operations(holding_id)",
];

const HOLDING_COLUMNS: &str = "id, object_id, quantity, purchase_price, purchase_date, \
     sale_price, sale_date, purchase_order_id, sale_order_id, status, created_date";

const OBJECT_COLUMNS: &str =
    "id, name, quantity, value, buy_price, sell_price, min_appreciation, validity_days";

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

/// An open write transaction. Holds the writer lock until committed or dropped;
/// dropping without commit rolls back.
pub struct WriteTx<'a> {
    _guard: MutexGuard<'a, ()>,
    tx: Transaction<'static, Sqlite>,
}

impl WriteTx<'_> {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<(), DbError> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl Database {
    /// Open (or create) a database file and apply the schema
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("Database pool created for {} with max 5 connections", database_url);

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.init_schema().await?;
        Ok(db)
    }

    /// Private in-memory database. A single pinned connection keeps the
    /// memory store alive for the lifetime of the pool.
    pub async fn in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.init_schema().await?;
        Ok(db)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), DbError> {
        let mut tx = self.begin_write().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(tx.conn()).await?;
        }
        tx.commit().await
    }

    /// Start the single-writer transaction
    pub async fn begin_write(&self) -> Result<WriteTx<'_>, DbError> {
        let guard = self.write_lock.lock().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTx { _guard: guard, tx })
    }

    // ==========================================
    // Purchase Object Operations
    // ==========================================

    pub async fn list_objects(&self) -> Result<Vec<PurchaseObject>, DbError> {
        let sql = format!("SELECT {} FROM purchase_objects ORDER BY id", OBJECT_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;

        let mut objects = Vec::with_capacity(rows.len());
        for row in rows {
            objects.push(PurchaseObject::from_row(&row)?);
        }
        Ok(objects)
    }

    pub async fn get_object(&self, id: i64) -> Result<Option<PurchaseObject>, DbError> {
        let sql = format!("SELECT {} FROM purchase_objects WHERE id = ?", OBJECT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await?;

        match row {
            Some(row) => Ok(Some(PurchaseObject::from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn insert_object(
        conn: &mut SqliteConnection,
        spec: &ObjectSpec,
    ) -> Result<i64, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO purchase_objects (
                name, quantity, value, buy_price, sell_price, min_appreciation, validity_days
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(spec.name.trim())
        .bind(spec.quantity)
        .bind(spec.value)
        .bind(spec.buy_price)
        .bind(spec.sell_price)
        .bind(spec.min_appreciation)
        .bind(spec.validity_days)
        .execute(conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn update_object(
        conn: &mut SqliteConnection,
        id: i64,
        spec: &ObjectSpec,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE purchase_objects
            SET name = ?, quantity = ?, value = ?, buy_price = ?, sell_price = ?,
                min_appreciation = ?, validity_days = ?
            WHERE id = ?
            "#,
        )
        .bind(spec.name.trim())
        .bind(spec.quantity)
        .bind(spec.value)
        .bind(spec.buy_price)
        .bind(spec.sell_price)
        .bind(spec.min_appreciation)
        .bind(spec.validity_days)
        .bind(id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub async fn delete_object(conn: &mut SqliteConnection, id: i64) -> Result<(), DbError> {
        let result = sqlx::query("DELETE FROM purchase_objects WHERE id = ?")
            .bind(id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub async fn object_exists(conn: &mut SqliteConnection, id: i64) -> Result<bool, DbError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM purchase_objects WHERE id = ?")
            .bind(id)
            .fetch_one(conn)
            .await?;
        Ok(row.0 > 0)
    }

    /// Count holdings referencing an object, optionally only open ones
    pub async fn count_holdings_for_object(
        conn: &mut SqliteConnection,
        object_id: i64,
        open_only: bool,
    ) -> Result<i64, DbError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM holdings
            WHERE object_id = ? AND (? = 0 OR status = 'Open')
            "#,
        )
        .bind(object_id)
        .bind(open_only)
        .fetch_one(conn)
        .await?;
        Ok(row.0)
    }

    // ==========================================
    // Holding Operations
    // ==========================================

    pub async fn get_holding(&self, id: i64) -> Result<Option<Holding>, DbError> {
        let sql = format!("SELECT {} FROM holdings WHERE id = ?", HOLDING_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await?;

        match row {
            Some(row) => Ok(Some(Holding::from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Same as [`get_holding`](Self::get_holding) but inside a write transaction
    pub async fn fetch_holding(
        conn: &mut SqliteConnection,
        id: i64,
    ) -> Result<Option<Holding>, DbError> {
        let sql = format!("SELECT {} FROM holdings WHERE id = ?", HOLDING_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(conn).await?;

        match row {
            Some(row) => Ok(Some(Holding::from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Open holdings, oldest purchase first
    pub async fn get_open_holdings(&self) -> Result<Vec<Holding>, DbError> {
        let sql = format!(
            "SELECT {} FROM holdings WHERE status = 'Open' ORDER BY purchase_date ASC, id ASC",
            HOLDING_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;

        let mut holdings = Vec::with_capacity(rows.len());
        for row in rows {
            holdings.push(Holding::from_row(&row)?);
        }
        Ok(holdings)
    }

    pub async fn list_holdings(
        &self,
        status: Option<HoldingStatus>,
    ) -> Result<Vec<Holding>, DbError> {
        let sql = format!(
            "SELECT {} FROM holdings WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC",
            HOLDING_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(self.pool())
            .await?;

        let mut holdings = Vec::with_capacity(rows.len());
        for row in rows {
            holdings.push(Holding::from_row(&row)?);
        }
        Ok(holdings)
    }

    pub async fn insert_holding(
        conn: &mut SqliteConnection,
        holding: &NewHolding,
    ) -> Result<i64, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO holdings (
                object_id, quantity, purchase_price, purchase_date,
                purchase_order_id, status, created_date
            )
            VALUES (?, ?, ?, ?, ?, 'Open', ?)
            "#,
        )
        .bind(holding.object_id)
        .bind(holding.quantity)
        .bind(holding.purchase_price)
        .bind(holding.purchase_date)
        .bind(&holding.purchase_order_id)
        .bind(Utc::now())
        .execute(conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Open -> Sold. Returns false when the holding was no longer open.
    pub async fn mark_sold(
        conn: &mut SqliteConnection,
        id: i64,
        sale_price: f64,
        sale_date: DateTime<Utc>,
        sale_order_id: &str,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE holdings
            SET status = 'Sold', sale_price = ?, sale_date = ?, sale_order_id = ?
            WHERE id = ? AND status = 'Open'
            "#,
        )
        .bind(sale_price)
        .bind(sale_date)
        .bind(sale_order_id)
        .bind(id)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Open -> Cancelled. Returns false when the holding was no longer open.
    pub async fn mark_cancelled(conn: &mut SqliteConnection, id: i64) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE holdings SET status = 'Cancelled' WHERE id = ? AND status = 'Open'",
        )
        .bind(id)
            .execute(conn)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    // ==========================================
    // Operation Log
    // ==========================================

    pub async fn insert_operation(
        conn: &mut SqliteConnection,
        op: &NewOperation,
    ) -> Result<i64, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO operations (holding_id, action, quantity, price, gain, date)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(op.holding_id)
        .bind(op.action.as_str())
        .bind(op.quantity)
        .bind(op.price)
        .bind(op.gain)
        .bind(op.date)
        .execute(conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn operations_for(&self, holding_id: i64) -> Result<Vec<Operation>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT id, holding_id, action, quantity, price, gain, date
            FROM operations
            WHERE holding_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(holding_id)
        .fetch_all(self.pool())
        .await?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            ops.push(Operation::from_row(&row)?);
        }
        Ok(ops)
    }

    /// (operations, sells, realized gain of sold holdings)
    pub async fn operation_totals(&self) -> Result<(i64, i64, f64), DbError> {
        let row: (i64, i64, f64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN action = 'sell' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(gain), 0.0)
            FROM operations
            "#,
        )
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ObjectSpec {
        ObjectSpec {
            name: name.to_string(),
            quantity: 0.5,
            value: 50.0,
            buy_price: 100.0,
            sell_price: 110.0,
            min_appreciation: 0.05,
            validity_days: 1,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_write_rolls_back() {
        let db = Database::in_memory().await.unwrap();
        {
            let mut tx = db.begin_write().await.unwrap();
            Database::insert_object(tx.conn(), &spec("dropped")).await.unwrap();
            // dropped without commit
        }
        assert!(db.list_objects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_sold_only_once() {
        let db = Database::in_memory().await.unwrap();
        let mut tx = db.begin_write().await.unwrap();
        let object_id = Database::insert_object(tx.conn(), &spec("lot")).await.unwrap();
        let holding_id = Database::insert_holding(
            tx.conn(),
            &NewHolding {
                object_id,
                quantity: 0.5,
                purchase_price: 100.0,
                purchase_date: Utc::now(),
                purchase_order_id: "1".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(Database::mark_sold(tx.conn(), holding_id, 120.0, Utc::now(), "2").await.unwrap());
        assert!(!Database::mark_sold(tx.conn(), holding_id, 130.0, Utc::now(), "3").await.unwrap());
        assert!(!Database::mark_cancelled(tx.conn(), holding_id).await.unwrap());
        tx.commit().await.unwrap();

        let holding = db.get_holding(holding_id).await.unwrap().unwrap();
        assert_eq!(holding.status, HoldingStatus::Sold);
        assert_eq!(holding.sale_price, Some(120.0));
        assert_eq!(holding.sale_order_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_foreign_key_rejects_orphan_holding() {
        let db = Database::in_memory().await.unwrap();
        let mut tx = db.begin_write().await.unwrap();
        let result = Database::insert_holding(
            tx.conn(),
            &NewHolding {
                object_id: 42,
                quantity: 1.0,
                purchase_price: 1.0,
                purchase_date: Utc::now(),
                purchase_order_id: "x".to_string(),
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_file_database_persists_across_pools() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("trader.db").display());

        {
            let db = Database::connect(&url).await.unwrap();
            let mut tx = db.begin_write().await.unwrap();
            Database::insert_object(tx.conn(), &spec("persisted")).await.unwrap();
            tx.commit().await.unwrap();
            db.pool().close().await;
        }

        let db = Database::connect(&url).await.unwrap();
        let objects = db.list_objects().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, "persisted");
    }
}
