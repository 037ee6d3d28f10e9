//! Lot Trader - lot-based spot trading engine
//!
//! A price monitor polls the exchange quote, a trader loop sells lots that
//! reached their target appreciation and cancels the ones that outlived
//! their validity, and every transition is recorded in a SQLite ledger.

pub mod api;
pub mod config_manager;
pub mod db;
pub mod event_bus;
pub mod exchange;
pub mod ledger;
pub mod price_monitor;
pub mod retry;
pub mod trader_loop;
pub mod trading;
pub mod types;

use std::sync::Arc;

use crate::trading::TradingEngine;

/// Application state shared across all handlers
pub struct AppState {
    pub engine: Arc<TradingEngine>,
}
