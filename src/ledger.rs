//! Inventory ledger - purchase objects, holdings and the operations log
//!
//! The ledger owns all canonical state. Each mutation is one write
//! transaction: a holding's status change and its Operation row commit
//! together or not at all. Exchange calls happen before the transaction
//! opens, so a failed order never leaves a trace in the database.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::db::{
    Database, DbError, Holding, HoldingStatus, NewHolding, NewOperation, ObjectSpec, Operation,
    OperationAction, PurchaseObject,
};
use crate::exchange::{ExchangeClient, ExchangeError};
use crate::types::{realized_gain, Performance};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Db(DbError),
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Purchase object {0} is referenced by holdings")]
    ObjectInUse(i64),
    #[error("Invalid purchase object: {0}")]
    InvalidObject(String),
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),
}

impl From<DbError> for LedgerError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::InvalidData(msg) => LedgerError::DataIntegrity(msg),
            DbError::Sqlx(sqlx::Error::Decode(inner)) => {
                LedgerError::DataIntegrity(inner.to_string())
            }
            DbError::Sqlx(sqlx::Error::ColumnDecode { index, source }) => {
                LedgerError::DataIntegrity(format!("column {}: {}", index, source))
            }
            other => LedgerError::Db(other),
        }
    }
}

pub struct InventoryLedger {
    db: Database,
    /// Serializes buys against edits and deletes of the same object
    object_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl InventoryLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            object_locks: DashMap::new(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn object_lock(&self, object_id: i64) -> Arc<Mutex<()>> {
        self.object_locks.entry(object_id).or_default().clone()
    }

    // ==========================================
    // Purchase Objects
    // ==========================================

    pub async fn define_object(&self, spec: &ObjectSpec) -> Result<i64, LedgerError> {
        spec.validate().map_err(LedgerError::InvalidObject)?;

        let mut tx = self.db.begin_write().await?;
        let id = Database::insert_object(tx.conn(), spec).await?;
        tx.commit().await?;

        info!("Defined purchase object {} '{}'", id, spec.name.trim());
        Ok(id)
    }

    pub async fn list_objects(&self) -> Result<Vec<PurchaseObject>, LedgerError> {
        Ok(self.db.list_objects().await?)
    }

    pub async fn get_object(&self, id: i64) -> Result<PurchaseObject, LedgerError> {
        self.db
            .get_object(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("purchase object {}", id)))
    }

    /// Edit a template. Refused while an open holding still references it.
    pub async fn update_object(
        &self,
        id: i64,
        spec: &ObjectSpec,
    ) -> Result<PurchaseObject, LedgerError> {
        spec.validate().map_err(LedgerError::InvalidObject)?;

        let lock = self.object_lock(id);
        let _guard = lock.lock().await;

        let mut tx = self.db.begin_write().await?;
        if !Database::object_exists(tx.conn(), id).await? {
            return Err(LedgerError::NotFound(format!("purchase object {}", id)));
        }
        if Database::count_holdings_for_object(tx.conn(), id, true).await? > 0 {
            return Err(LedgerError::ObjectInUse(id));
        }
        Database::update_object(tx.conn(), id, spec).await?;
        tx.commit().await?;

        info!("Updated purchase object {}", id);
        self.get_object(id).await
    }

    /// Delete a template that no holding has ever referenced
    pub async fn delete_object(&self, id: i64) -> Result<(), LedgerError> {
        let lock = self.object_lock(id);
        let _guard = lock.lock().await;

        let mut tx = self.db.begin_write().await?;
        if !Database::object_exists(tx.conn(), id).await? {
            return Err(LedgerError::NotFound(format!("purchase object {}", id)));
        }
        if Database::count_holdings_for_object(tx.conn(), id, false).await? > 0 {
            return Err(LedgerError::ObjectInUse(id));
        }
        Database::delete_object(tx.conn(), id).await?;
        tx.commit().await?;

        self.object_locks.remove(&id);
        info!("Deleted purchase object {}", id);
        Ok(())
    }

    // ==========================================
    // Holding Transitions
    // ==========================================

    /// Buy one lot of `object_id` at market and record it.
    ///
    /// The purchase price is the quote fetched right before the order. Any
    /// exchange failure returns before the ledger is touched.
    pub async fn open_holding(
        &self,
        exchange: &dyn ExchangeClient,
        symbol: &str,
        object_id: i64,
        quantity: f64,
    ) -> Result<Holding, LedgerError> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(LedgerError::InvalidObject(format!(
                "quantity must be greater than 0, got {}",
                quantity
            )));
        }

        let lock = self.object_lock(object_id);
        let _guard = lock.lock().await;

        let object = self.get_object(object_id).await?;

        let price = exchange.get_quote(symbol).await?;
        let order_id = exchange.place_market_buy(symbol, quantity).await?;
        let purchase_date = Utc::now();

        let record = NewHolding {
            object_id,
            quantity,
            purchase_price: price,
            purchase_date,
            purchase_order_id: order_id.clone(),
        };

        let holding_id = match self.record_buy(&record).await {
            Ok(id) => id,
            Err(e) => {
                // the exchange filled but nothing is recorded; needs manual reconciliation
                error!(
                    "Buy order {} for object {} filled but was not recorded: {}",
                    order_id, object_id, e
                );
                return Err(e);
            }
        };

        info!(
            "Opened holding {} ('{}'): {} @ {:.2} (order {})",
            holding_id, object.name, quantity, price, order_id
        );

        self.db
            .get_holding(holding_id)
            .await?
            .ok_or_else(|| {
                LedgerError::DataIntegrity(format!("holding {} vanished after insert", holding_id))
            })
    }

    async fn record_buy(&self, record: &NewHolding) -> Result<i64, LedgerError> {
        let mut tx = self.db.begin_write().await?;
        let holding_id = Database::insert_holding(tx.conn(), record).await?;
        Database::insert_operation(
            tx.conn(),
            &NewOperation {
                holding_id,
                action: OperationAction::Buy,
                quantity: record.quantity,
                price: record.purchase_price,
                gain: 0.0,
                date: record.purchase_date,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(holding_id)
    }

    /// Open -> Sold after a confirmed sell. Returns the realized gain.
    pub async fn close_holding(
        &self,
        holding_id: i64,
        sale_price: f64,
        sale_order_id: &str,
    ) -> Result<f64, LedgerError> {
        if !sale_price.is_finite() || sale_price <= 0.0 {
            return Err(LedgerError::InvalidState(format!("invalid sale price {}", sale_price)));
        }

        let mut tx = self.db.begin_write().await?;
        let holding = Self::fetch_open(tx.conn(), holding_id).await?;

        let gain = realized_gain(holding.quantity, holding.purchase_price, sale_price);
        let sale_date = Utc::now();

        let marked =
            Database::mark_sold(tx.conn(), holding_id, sale_price, sale_date, sale_order_id).await?;
        if !marked {
            return Err(LedgerError::InvalidState(format!(
                "holding {} is no longer open",
                holding_id
            )));
        }
        Database::insert_operation(
            tx.conn(),
            &NewOperation {
                holding_id,
                action: OperationAction::Sell,
                quantity: holding.quantity,
                price: sale_price,
                gain,
                date: sale_date,
            },
        )
        .await?;
        tx.commit().await?;

        info!("Closed holding {} @ {:.2}, gain {:.8}", holding_id, sale_price, gain);
        Ok(gain)
    }

    /// Open -> Cancelled. Recorded as a zero-gain sell at the purchase price;
    /// no order is sent.
    pub async fn cancel_holding(&self, holding_id: i64) -> Result<(), LedgerError> {
        let mut tx = self.db.begin_write().await?;
        let holding = Self::fetch_open(tx.conn(), holding_id).await?;

        if !Database::mark_cancelled(tx.conn(), holding_id).await? {
            return Err(LedgerError::InvalidState(format!(
                "holding {} is no longer open",
                holding_id
            )));
        }
        Database::insert_operation(
            tx.conn(),
            &NewOperation {
                holding_id,
                action: OperationAction::Sell,
                quantity: holding.quantity,
                price: holding.purchase_price,
                gain: 0.0,
                date: Utc::now(),
            },
        )
        .await?;
        tx.commit().await?;

        info!("Cancelled holding {}", holding_id);
        Ok(())
    }

    async fn fetch_open(
        conn: &mut sqlx::SqliteConnection,
        holding_id: i64,
    ) -> Result<Holding, LedgerError> {
        let holding = Database::fetch_holding(conn, holding_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("holding {}", holding_id)))?;
        if holding.status != HoldingStatus::Open {
            return Err(LedgerError::InvalidState(format!(
                "holding {} is {}, expected Open",
                holding_id, holding.status
            )));
        }
        Ok(holding)
    }

    // ==========================================
    // Queries
    // ==========================================

    /// Committed open holdings, oldest purchase first
    pub async fn get_open_holdings(&self) -> Result<Vec<Holding>, LedgerError> {
        Ok(self.db.get_open_holdings().await?)
    }

    pub async fn get_holding(&self, id: i64) -> Result<Holding, LedgerError> {
        self.db
            .get_holding(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("holding {}", id)))
    }

    pub async fn list_holdings(
        &self,
        status: Option<HoldingStatus>,
    ) -> Result<Vec<Holding>, LedgerError> {
        Ok(self.db.list_holdings(status).await?)
    }

    pub async fn operations_for(&self, holding_id: i64) -> Result<Vec<Operation>, LedgerError> {
        self.get_holding(holding_id).await?;
        Ok(self.db.operations_for(holding_id).await?)
    }

    pub async fn performance(&self) -> Result<Performance, LedgerError> {
        let (operations, sells, realized_gain) = self.db.operation_totals().await?;
        Ok(Performance {
            operations,
            sells,
            realized_gain,
        })
    }
}
