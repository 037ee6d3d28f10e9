//! Type definitions shared by the monitor, the decision loop and the adapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Holding, PurchaseObject};

/// Latest quote published by the price monitor.
///
/// `version` increases by one on every publish, so readers can tell a fresh
/// quote from one they already acted on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

/// Account balances for the traded pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    /// Free balance of the base asset (e.g. BTC)
    pub base: f64,
    /// Free balance of the quote asset (e.g. BRL)
    pub quote: f64,
}

pub fn purchase_cost(quantity: f64, purchase_price: f64) -> f64 {
    quantity * purchase_price
}

/// Fractional gain of a lot at `current_price`. Zero-cost lots never appreciate.
pub fn appreciation(quantity: f64, purchase_price: f64, current_price: f64) -> f64 {
    let cost = purchase_cost(quantity, purchase_price);
    if cost == 0.0 {
        return 0.0;
    }
    (quantity * current_price - cost) / cost
}

/// Realized gain of selling a whole lot
pub fn realized_gain(quantity: f64, purchase_price: f64, sale_price: f64) -> f64 {
    quantity * (sale_price - purchase_price)
}

/// Read-only view of an open holding valued at a given price.
/// This is what observers receive in `InventoryChanged`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingSnapshot {
    pub holding_id: i64,
    pub object_id: i64,
    pub name: String,
    pub quantity: f64,
    pub purchase_price: f64,
    pub purchase_date: DateTime<Utc>,
    pub current_price: f64,
    pub current_value: f64,
    pub unrealized_gain: f64,
    pub appreciation: f64,
}

impl HoldingSnapshot {
    pub fn new(holding: &Holding, object: &PurchaseObject, current_price: f64) -> Self {
        let current_value = holding.quantity * current_price;
        Self {
            holding_id: holding.id,
            object_id: holding.object_id,
            name: object.name.clone(),
            quantity: holding.quantity,
            purchase_price: holding.purchase_price,
            purchase_date: holding.purchase_date,
            current_price,
            current_value,
            unrealized_gain: current_value - holding.purchase_cost(),
            appreciation: appreciation(holding.quantity, holding.purchase_price, current_price),
        }
    }
}

/// Preview of a manual sale at the current quote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalePreview {
    pub holding_id: i64,
    pub name: String,
    pub quantity: f64,
    pub cost: f64,
    pub current_price: f64,
    pub current_value: f64,
    pub gain: f64,
}

/// Decision-loop statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraderStats {
    pub cycles_completed: u64,
    pub holdings_evaluated: u64,
    pub sells: u64,
    pub cancellations: u64,
    pub rejected_orders: u64,
    pub errors: u64,
    pub last_price: Option<f64>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Operations summary shown next to the log ("operations | total profit")
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub operations: i64,
    pub sells: i64,
    pub realized_gain: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appreciation_threshold_boundary() {
        assert!(appreciation(1.0, 100.0, 104.0) < 0.05);
        assert!(appreciation(1.0, 100.0, 105.0001) >= 0.05);
    }

    #[test]
    fn test_appreciation_zero_cost() {
        assert_eq!(appreciation(0.0, 100.0, 150.0), 0.0);
        assert_eq!(appreciation(1.0, 0.0, 150.0), 0.0);
    }

    #[test]
    fn test_realized_gain() {
        let gain = realized_gain(0.00042, 310_000.0, 325_500.0);
        assert!((gain - 0.00042 * 15_500.0).abs() < 1e-8);
        assert!(realized_gain(2.0, 10.0, 9.0) < 0.0);
    }
}
