//! Paper exchange - fills market orders at the current simulated price

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ExchangeClient, ExchangeError};
use crate::types::Balances;

#[derive(Default)]
struct PaperState {
    price: f64,
    balances: Balances,
    quote_failures: VecDeque<ExchangeError>,
    buy_failures: VecDeque<ExchangeError>,
    sell_failures: VecDeque<ExchangeError>,
}

/// In-process exchange. Orders fill instantly at the current price and move
/// balances; failures can be queued to script a scenario. With a quote
/// source the price follows a live feed.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    quote_source: Option<Arc<dyn ExchangeClient>>,
    order_seq: AtomicU64,
    buys: AtomicU64,
    sells: AtomicU64,
    quotes: AtomicU64,
    fill_delay: Mutex<Duration>,
}

impl PaperExchange {
    pub fn new(price: f64, balances: Balances) -> Self {
        Self {
            state: Mutex::new(PaperState {
                price,
                balances,
                ..Default::default()
            }),
            quote_source: None,
            order_seq: AtomicU64::new(0),
            buys: AtomicU64::new(0),
            sells: AtomicU64::new(0),
            quotes: AtomicU64::new(0),
            fill_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Plenty of both assets, for tests that are not about funds
    pub fn with_price(price: f64) -> Self {
        Self::new(
            price,
            Balances {
                base: 1_000.0,
                quote: 1_000_000_000.0,
            },
        )
    }

    /// Dry-run exchange: quotes come from `source`, orders are simulated
    pub fn with_quote_source(source: Arc<dyn ExchangeClient>, balances: Balances) -> Self {
        Self {
            quote_source: Some(source),
            ..Self::new(0.0, balances)
        }
    }

    pub fn set_price(&self, price: f64) {
        self.state.lock().price = price;
    }

    pub fn price(&self) -> f64 {
        self.state.lock().price
    }

    pub fn balances(&self) -> Balances {
        self.state.lock().balances
    }

    pub fn fail_next_quote(&self, error: ExchangeError) {
        self.state.lock().quote_failures.push_back(error);
    }

    pub fn fail_next_buy(&self, error: ExchangeError) {
        self.state.lock().buy_failures.push_back(error);
    }

    pub fn fail_next_sell(&self, error: ExchangeError) {
        self.state.lock().sell_failures.push_back(error);
    }

    /// Delay applied before each fill, to widen race windows in tests
    pub fn set_fill_delay(&self, delay: Duration) {
        *self.fill_delay.lock() = delay;
    }

    pub fn buys(&self) -> u64 {
        self.buys.load(Ordering::SeqCst)
    }

    pub fn sells(&self) -> u64 {
        self.sells.load(Ordering::SeqCst)
    }

    pub fn quotes(&self) -> u64 {
        self.quotes.load(Ordering::SeqCst)
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.order_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn wait_fill(&self) {
        let delay = *self.fill_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_quote(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let failure = self.state.lock().quote_failures.pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        let price = match &self.quote_source {
            Some(source) => {
                let price = source.get_quote(symbol).await?;
                self.state.lock().price = price;
                price
            }
            None => self.state.lock().price,
        };
        self.quotes.fetch_add(1, Ordering::SeqCst);
        Ok(price)
    }

    async fn place_market_buy(&self, symbol: &str, quantity: f64) -> Result<String, ExchangeError> {
        self.wait_fill().await;

        let mut state = self.state.lock();
        if let Some(err) = state.buy_failures.pop_front() {
            return Err(err);
        }
        if quantity <= 0.0 {
            return Err(ExchangeError::RejectedOrder(format!("invalid quantity {}", quantity)));
        }

        let cost = quantity * state.price;
        if cost > state.balances.quote {
            return Err(ExchangeError::InsufficientFunds(format!(
                "need {:.2}, have {:.2}",
                cost, state.balances.quote
            )));
        }
        state.balances.quote -= cost;
        state.balances.base += quantity;
        drop(state);

        self.buys.fetch_add(1, Ordering::SeqCst);
        let order_id = self.next_order_id();
        debug!("Paper BUY {} {} -> {}", quantity, symbol, order_id);
        Ok(order_id)
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        self.wait_fill().await;

        let mut state = self.state.lock();
        if let Some(err) = state.sell_failures.pop_front() {
            return Err(err);
        }
        if quantity <= 0.0 {
            return Err(ExchangeError::RejectedOrder(format!("invalid quantity {}", quantity)));
        }
        if quantity > state.balances.base + 1e-12 {
            return Err(ExchangeError::InsufficientFunds(format!(
                "need {}, have {}",
                quantity, state.balances.base
            )));
        }
        state.balances.base -= quantity;
        state.balances.quote += quantity * state.price;
        drop(state);

        self.sells.fetch_add(1, Ordering::SeqCst);
        let order_id = self.next_order_id();
        debug!("Paper SELL {} {} -> {}", quantity, symbol, order_id);
        Ok(order_id)
    }

    async fn get_balances(
        &self,
        _base_asset: &str,
        _quote_asset: &str,
    ) -> Result<Balances, ExchangeError> {
        Ok(self.state.lock().balances)
    }

    fn name(&self) -> &str {
        "paper"
    }
}
