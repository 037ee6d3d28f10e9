//! Database models matching the SQLite schema

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;

/// Purchase object template - operator authored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseObject {
    pub id: i64,
    pub name: String,
    /// Lot size bought per holding (base asset units)
    pub quantity: f64,
    pub value: f64,
    pub buy_price: f64,
    pub sell_price: f64,
    /// Fractional appreciation that triggers an automatic sell (0.05 = 5%)
    pub min_appreciation: f64,
    pub validity_days: i64,
}

/// Longest validity an object may be given (100 years)
pub const MAX_VALIDITY_DAYS: i64 = 36_500;

impl PurchaseObject {
    /// Maximum age a holding of this template may stay open. Zero days
    /// means holdings never expire, and so does a value too large to
    /// represent.
    pub fn validity(&self) -> Option<Duration> {
        if self.validity_days <= 0 {
            return None;
        }
        Duration::try_days(self.validity_days)
    }
}

impl<'r> FromRow<'r, SqliteRow> for PurchaseObject {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            quantity: row.try_get("quantity")?,
            value: row.try_get("value")?,
            buy_price: row.try_get("buy_price")?,
            sell_price: row.try_get("sell_price")?,
            min_appreciation: row.try_get("min_appreciation")?,
            validity_days: row.try_get("validity_days")?,
        })
    }
}

/// Object definition as submitted by the operator (create or edit)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub name: String,
    pub quantity: f64,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub buy_price: f64,
    #[serde(default)]
    pub sell_price: f64,
    pub min_appreciation: f64,
    #[serde(alias = "validity")]
    pub validity_days: i64,
}

impl ObjectSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(format!("quantity must be greater than 0, got {}", self.quantity));
        }
        if !self.min_appreciation.is_finite() {
            return Err("min_appreciation must be a finite fraction".to_string());
        }
        for (field, v) in [
            ("value", self.value),
            ("buy_price", self.buy_price),
            ("sell_price", self.sell_price),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("{} must be a non-negative number", field));
            }
        }
        if !(0..=MAX_VALIDITY_DAYS).contains(&self.validity_days) {
            return Err(format!(
                "validity_days must be between 0 and {}, got {}",
                MAX_VALIDITY_DAYS, self.validity_days
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a holding. Only Open -> Sold and Open -> Cancelled exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HoldingStatus {
    Open,
    Sold,
    Cancelled,
}

impl HoldingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldingStatus::Open => "Open",
            HoldingStatus::Sold => "Sold",
            HoldingStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, HoldingStatus::Open)
    }
}

impl fmt::Display for HoldingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HoldingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open" => Ok(HoldingStatus::Open),
            "Sold" => Ok(HoldingStatus::Sold),
            "Cancelled" => Ok(HoldingStatus::Cancelled),
            other => Err(format!("unknown holding status '{}'", other)),
        }
    }
}

/// One purchased lot, tracked from buy through sale or cancellation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub id: i64,
    pub object_id: i64,
    pub quantity: f64,
    pub purchase_price: f64,
    pub purchase_date: DateTime<Utc>,
    pub sale_price: Option<f64>,
    pub sale_date: Option<DateTime<Utc>>,
    pub purchase_order_id: String,
    pub sale_order_id: Option<String>,
    pub status: HoldingStatus,
    pub created_date: DateTime<Utc>,
}

impl Holding {
    pub fn purchase_cost(&self) -> f64 {
        crate::types::purchase_cost(self.quantity, self.purchase_price)
    }

    pub fn is_open(&self) -> bool {
        self.status == HoldingStatus::Open
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.purchase_date
    }
}

impl<'r> FromRow<'r, SqliteRow> for Holding {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            object_id: row.try_get("object_id")?,
            quantity: row.try_get("quantity")?,
            purchase_price: row.try_get("purchase_price")?,
            purchase_date: row.try_get("purchase_date")?,
            sale_price: row.try_get("sale_price")?,
            sale_date: row.try_get("sale_date")?,
            purchase_order_id: row.try_get("purchase_order_id")?,
            sale_order_id: row.try_get("sale_order_id")?,
            status: status.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            created_date: row.try_get("created_date")?,
        })
    }
}

/// Holding row to insert after the exchange confirmed the buy
#[derive(Debug, Clone)]
pub struct NewHolding {
    pub object_id: i64,
    pub quantity: f64,
    pub purchase_price: f64,
    pub purchase_date: DateTime<Utc>,
    pub purchase_order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationAction {
    Buy,
    Sell,
}

impl OperationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationAction::Buy => "buy",
            OperationAction::Sell => "sell",
        }
    }
}

impl FromStr for OperationAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(OperationAction::Buy),
            "sell" => Ok(OperationAction::Sell),
            other => Err(format!("unknown operation action '{}'", other)),
        }
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: i64,
    pub holding_id: i64,
    pub action: OperationAction,
    pub quantity: f64,
    pub price: f64,
    pub gain: f64,
    pub date: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Operation {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let action: String = row.try_get("action")?;
        Ok(Self {
            id: row.try_get("id")?,
            holding_id: row.try_get("holding_id")?,
            action: action.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            quantity: row.try_get("quantity")?,
            price: row.try_get("price")?,
            gain: row.try_get("gain")?,
            date: row.try_get("date")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewOperation {
    pub holding_id: i64,
    pub action: OperationAction,
    pub quantity: f64,
    pub price: f64,
    pub gain: f64,
    pub date: DateTime<Utc>,
}
