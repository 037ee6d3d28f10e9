//! Trading module - engine controller
//!
//! Wires the price monitor, the trader loop and the ledger into a single
//! start/stop interface for the API layer.

mod engine;

pub use engine::{EngineError, EngineStatus, TradingEngine};
