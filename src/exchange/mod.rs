//! Exchange client seam
//!
//! The engine only ever talks to the exchange through [`ExchangeClient`]:
//! quote lookup, market orders for whole lots, and account balances.
//! `BinanceClient` is the live REST implementation, `PaperExchange` an
//! in-process simulation used for dry runs and tests.

mod binance;
mod paper;

pub use binance::{BinanceClient, DEFAULT_BASE_URL};
pub use paper::PaperExchange;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Balances;

/// Exchange failures, classified by how the engine must react to them
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    /// Timeouts, connection failures, 5xx and rate limits. Safe to retry later.
    #[error("Network error: {0}")]
    Network(String),
    #[error("Order rejected: {0}")]
    RejectedOrder(String),
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),
    /// Bad or revoked credentials. Fatal for the workers.
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Auth(_))
    }

    /// Rejections leave state untouched and may succeed on a later cycle
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ExchangeError::RejectedOrder(_) | ExchangeError::InsufficientFunds(_)
        )
    }
}

/// Quote lookup and market order placement for a single symbol
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Last traded price for `symbol`
    async fn get_quote(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Market buy of `quantity` base units. Returns the exchange order id.
    async fn place_market_buy(&self, symbol: &str, quantity: f64) -> Result<String, ExchangeError>;

    /// Market sell of `quantity` base units. Returns the exchange order id.
    async fn place_market_sell(&self, symbol: &str, quantity: f64) -> Result<String, ExchangeError>;

    /// Free balances of the two assets of the traded pair
    async fn get_balances(
        &self,
        base_asset: &str,
        quote_asset: &str,
    ) -> Result<Balances, ExchangeError>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ExchangeError::Network("timeout".into()).is_transient());
        assert!(!ExchangeError::Network("timeout".into()).is_fatal());
        assert!(ExchangeError::Auth("bad key".into()).is_fatal());
        assert!(ExchangeError::RejectedOrder("min notional".into()).is_rejection());
        assert!(ExchangeError::InsufficientFunds("BRL".into()).is_rejection());
        assert!(!ExchangeError::InsufficientFunds("BRL".into()).is_transient());
    }
}
