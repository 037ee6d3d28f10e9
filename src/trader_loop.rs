//! Trader loop - reacts to quotes and settles open holdings
//!
//! Each new quote triggers one scan over every open holding:
//! 1. SELL: appreciation reached the object's threshold -> market sell, then close
//! 2. EXPIRE: holding outlived its validity below threshold -> cancel
//! 3. HOLD: nothing to do
//!
//! Holdings are evaluated concurrently and independently; one holding's
//! failure never stops the others. The ledger is only written after the
//! exchange confirmed the order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Holding, PurchaseObject};
use crate::event_bus::{EngineEvent, EventBus};
use crate::exchange::{ExchangeClient, ExchangeError};
use crate::ledger::{InventoryLedger, LedgerError};
use crate::price_monitor::QuoteReceiver;
use crate::types::{appreciation, HoldingSnapshot, SalePreview, TraderStats};

/// One lock per holding, shared by the scan and operator commands
pub type HoldingLocks = Arc<DashMap<i64, Arc<Mutex<()>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Sell,
    Expire,
    Hold,
}

/// Sell / expire / hold for one holding at `price`
pub fn evaluate(
    holding: &Holding,
    object: &PurchaseObject,
    price: f64,
    now: DateTime<Utc>,
    cancel_on_expiry: bool,
) -> Decision {
    if appreciation(holding.quantity, holding.purchase_price, price) >= object.min_appreciation {
        return Decision::Sell;
    }
    match object.validity() {
        Some(validity) if cancel_on_expiry && holding.age(now) >= validity => Decision::Expire,
        _ => Decision::Hold,
    }
}

#[derive(Debug, Clone)]
pub struct TraderSettings {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub cancel_on_expiry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Held,
    Sold,
    Cancelled,
    /// Locked by another settlement or already terminal
    Skipped,
    Rejected,
    Failed,
}

/// Counts from one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub evaluated: usize,
    pub sold: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub failed: usize,
}

pub struct TraderEngine {
    ledger: Arc<InventoryLedger>,
    exchange: Arc<dyn ExchangeClient>,
    bus: Arc<EventBus>,
    settings: TraderSettings,
    holding_locks: HoldingLocks,
    /// Engine-wide token, cancelled on fatal exchange errors
    halt: CancellationToken,
    stats: RwLock<TraderStats>,
}

impl TraderEngine {
    pub fn new(
        ledger: Arc<InventoryLedger>,
        exchange: Arc<dyn ExchangeClient>,
        bus: Arc<EventBus>,
        settings: TraderSettings,
        holding_locks: HoldingLocks,
        halt: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            exchange,
            bus,
            settings,
            holding_locks,
            halt,
            stats: RwLock::new(TraderStats::default()),
        }
    }

    pub fn stats(&self) -> TraderStats {
        self.stats.read().clone()
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeClient> {
        &self.exchange
    }

    fn lock_for(&self, holding_id: i64) -> Arc<Mutex<()>> {
        self.holding_locks.entry(holding_id).or_default().clone()
    }

    fn halt_on_fatal(&self, e: &ExchangeError) {
        if e.is_fatal() && !self.halt.is_cancelled() {
            self.bus.log_warn(format!("Trader halted: {}", e));
            self.bus.publish(EngineEvent::Halted {
                reason: e.to_string(),
            });
            self.halt.cancel();
        }
    }

    fn check_fatal<T>(&self, result: Result<T, ExchangeError>) -> Result<T, ExchangeError> {
        if let Err(e) = &result {
            self.halt_on_fatal(e);
        }
        result
    }

    /// Scan on every fresh quote until cancelled. A scan in progress is
    /// always allowed to finish.
    pub async fn run(self: Arc<Self>, mut quotes: QuoteReceiver, token: CancellationToken) {
        info!("Trader loop started for {}", self.settings.symbol);
        let mut last_version = 0;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                changed = quotes.changed() => {
                    if changed.is_err() {
                        debug!("Quote channel closed");
                        break;
                    }
                }
            }

            let quote = *quotes.borrow_and_update();
            let Some(quote) = quote else { continue };
            if quote.version <= last_version {
                continue;
            }
            last_version = quote.version;

            self.scan(quote.price).await;
        }

        let stats = self.stats();
        info!(
            "Trader loop stopped: {} cycles, {} sells, {} cancellations",
            stats.cycles_completed, stats.sells, stats.cancellations
        );
    }

    /// Evaluate every open holding at `price`
    pub async fn scan(&self, price: f64) -> ScanReport {
        let mut report = ScanReport::default();

        let (holdings, objects) = match self.load_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!("Scan aborted, could not read holdings: {}", e);
                self.stats.write().errors += 1;
                return report;
            }
        };

        let now = Utc::now();
        let outcomes = join_all(
            holdings
                .iter()
                .map(|h| self.process_holding(h, objects.get(&h.object_id), price, now)),
        )
        .await;

        report.evaluated = outcomes.len();
        for outcome in &outcomes {
            match outcome {
                Outcome::Held => {}
                Outcome::Sold => report.sold += 1,
                Outcome::Cancelled => report.cancelled += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Rejected => report.rejected += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.holdings_evaluated += report.evaluated as u64;
            stats.sells += report.sold as u64;
            stats.cancellations += report.cancelled as u64;
            stats.rejected_orders += report.rejected as u64;
            stats.errors += report.failed as u64;
            stats.last_price = Some(price);
            stats.last_cycle_at = Some(now);
        }

        self.publish_inventory(price).await;
        self.refresh_balances().await;

        if report.sold + report.cancelled > 0 {
            debug!("Scan at {:.2}: {:?}", price, report);
        }
        report
    }

    async fn load_positions(
        &self,
    ) -> Result<(Vec<Holding>, HashMap<i64, PurchaseObject>), LedgerError> {
        let holdings = self.ledger.get_open_holdings().await?;
        let objects = self
            .ledger
            .list_objects()
            .await?
            .into_iter()
            .map(|o| (o.id, o))
            .collect();
        Ok((holdings, objects))
    }

    async fn process_holding(
        &self,
        holding: &Holding,
        object: Option<&PurchaseObject>,
        price: f64,
        now: DateTime<Utc>,
    ) -> Outcome {
        let Some(object) = object else {
            let e = LedgerError::DataIntegrity(format!(
                "holding {} references missing object {}",
                holding.id, holding.object_id
            ));
            warn!("Skipping holding: {}", e);
            return Outcome::Failed;
        };

        let decision = evaluate(holding, object, price, now, self.settings.cancel_on_expiry);
        if decision == Decision::Hold {
            return Outcome::Held;
        }

        // an operator command owns this holding right now
        let Ok(_guard) = self.lock_for(holding.id).try_lock_owned() else {
            debug!("Holding {} busy, skipping this cycle", holding.id);
            return Outcome::Skipped;
        };

        let current = match self.ledger.get_holding(holding.id).await {
            Ok(h) if h.is_open() => h,
            Ok(_) => return Outcome::Skipped,
            Err(e) => {
                warn!("Could not re-read holding {}: {}", holding.id, e);
                return Outcome::Failed;
            }
        };

        let outcome = match decision {
            Decision::Sell => self.auto_sell(&current, object, price).await,
            Decision::Expire => match self.ledger.cancel_holding(current.id).await {
                Ok(()) => {
                    self.bus.log(format!(
                        "Holding {} ('{}') expired after {} days, cancelled",
                        current.id, object.name, object.validity_days
                    ));
                    Outcome::Cancelled
                }
                Err(e) => {
                    warn!("Cancel of holding {} failed: {}", current.id, e);
                    Outcome::Failed
                }
            },
            Decision::Hold => Outcome::Held,
        };

        if matches!(outcome, Outcome::Sold | Outcome::Cancelled) {
            self.holding_locks.remove(&current.id);
        }
        outcome
    }

    async fn auto_sell(&self, holding: &Holding, object: &PurchaseObject, price: f64) -> Outcome {
        let order_id = match self
            .exchange
            .place_market_sell(&self.settings.symbol, holding.quantity)
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_rejection() => {
                self.bus.log_warn(format!(
                    "Sell of holding {} rejected, retrying next cycle: {}",
                    holding.id, e
                ));
                return Outcome::Rejected;
            }
            Err(e) => {
                self.halt_on_fatal(&e);
                warn!("Sell of holding {} failed: {}", holding.id, e);
                return Outcome::Failed;
            }
        };

        match self.ledger.close_holding(holding.id, price, &order_id).await {
            Ok(gain) => {
                self.bus.log(format!(
                    "Sold holding {} ('{}') {} @ {:.2}, gain {:.2}",
                    holding.id, object.name, holding.quantity, price, gain
                ));
                Outcome::Sold
            }
            Err(e) => {
                error!(
                    "Sell order {} for holding {} filled but was not recorded: {}",
                    order_id, holding.id, e
                );
                Outcome::Failed
            }
        }
    }

    // ==========================================
    // Operator Commands
    // ==========================================

    /// Buy one lot of the object's quantity
    pub async fn buy(&self, object_id: i64) -> Result<Holding, LedgerError> {
        let object = self.ledger.get_object(object_id).await?;
        let holding = match self
            .ledger
            .open_holding(self.exchange.as_ref(), &self.settings.symbol, object_id, object.quantity)
            .await
        {
            Ok(holding) => holding,
            Err(LedgerError::Exchange(e)) => {
                self.halt_on_fatal(&e);
                return Err(LedgerError::Exchange(e));
            }
            Err(e) => return Err(e),
        };

        self.bus.log(format!(
            "Bought '{}': {} @ {:.2} (holding {})",
            object.name, holding.quantity, holding.purchase_price, holding.id
        ));
        self.publish_inventory(holding.purchase_price).await;
        self.refresh_balances().await;
        Ok(holding)
    }

    /// Sell a holding at market regardless of appreciation. Waits for a
    /// settlement already in progress on the same holding.
    pub async fn sell(&self, holding_id: i64) -> Result<f64, LedgerError> {
        self.require_open(holding_id).await?;

        let lock = self.lock_for(holding_id);
        let _guard = lock.lock_owned().await;
        let holding = self.require_open(holding_id).await?;

        let price = self.check_fatal(self.exchange.get_quote(&self.settings.symbol).await)?;
        let order_id = self.check_fatal(
            self.exchange
                .place_market_sell(&self.settings.symbol, holding.quantity)
                .await,
        )?;

        let gain = match self.ledger.close_holding(holding_id, price, &order_id).await {
            Ok(gain) => gain,
            Err(e) => {
                error!(
                    "Sell order {} for holding {} filled but was not recorded: {}",
                    order_id, holding_id, e
                );
                return Err(e);
            }
        };
        self.holding_locks.remove(&holding_id);

        self.bus.log(format!(
            "Manually sold holding {} {} @ {:.2}, gain {:.2}",
            holding_id, holding.quantity, price, gain
        ));
        self.publish_inventory(price).await;
        self.refresh_balances().await;
        Ok(gain)
    }

    /// Value of selling a holding at the current quote
    pub async fn sale_preview(&self, holding_id: i64) -> Result<SalePreview, LedgerError> {
        let holding = self.require_open(holding_id).await?;
        let object = self.ledger.get_object(holding.object_id).await?;
        let price = self.check_fatal(self.exchange.get_quote(&self.settings.symbol).await)?;
        let snapshot = HoldingSnapshot::new(&holding, &object, price);

        Ok(SalePreview {
            holding_id,
            name: object.name,
            quantity: holding.quantity,
            cost: holding.purchase_cost(),
            current_price: price,
            current_value: snapshot.current_value,
            gain: snapshot.unrealized_gain,
        })
    }

    async fn require_open(&self, holding_id: i64) -> Result<Holding, LedgerError> {
        let holding = self.ledger.get_holding(holding_id).await?;
        if !holding.is_open() {
            return Err(LedgerError::InvalidState(format!(
                "holding {} is {}, expected Open",
                holding_id, holding.status
            )));
        }
        Ok(holding)
    }

    /// Open holdings valued at `price`
    pub async fn snapshot(&self, price: f64) -> Result<Vec<HoldingSnapshot>, LedgerError> {
        let (holdings, objects) = self.load_positions().await?;
        let mut snapshot = Vec::with_capacity(holdings.len());
        for holding in &holdings {
            match objects.get(&holding.object_id) {
                Some(object) => snapshot.push(HoldingSnapshot::new(holding, object, price)),
                None => warn!(
                    "Holding {} references missing object {}, left out of snapshot",
                    holding.id, holding.object_id
                ),
            }
        }
        Ok(snapshot)
    }

    async fn publish_inventory(&self, price: f64) {
        match self.snapshot(price).await {
            Ok(holdings) => self.bus.publish(EngineEvent::InventoryChanged { holdings }),
            Err(e) => warn!("Inventory snapshot failed: {}", e),
        }
    }

    async fn refresh_balances(&self) {
        match self
            .exchange
            .get_balances(&self.settings.base_asset, &self.settings.quote_asset)
            .await
        {
            Ok(balances) => self.bus.publish(EngineEvent::BalanceUpdated {
                btc_balance: balances.base,
                fiat_balance: balances.quote,
            }),
            Err(e) => {
                self.halt_on_fatal(&e);
                warn!("Balance refresh failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, HoldingStatus, ObjectSpec};
    use crate::exchange::PaperExchange;
    use crate::types::Quote;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Fixture {
        ledger: Arc<InventoryLedger>,
        exchange: Arc<PaperExchange>,
        bus: Arc<EventBus>,
        trader: Arc<TraderEngine>,
        halt: CancellationToken,
    }

    async fn fixture(price: f64) -> Fixture {
        let ledger = Arc::new(InventoryLedger::new(Database::in_memory().await.unwrap()));
        let exchange = Arc::new(PaperExchange::with_price(price));
        let bus = Arc::new(EventBus::new());
        let halt = CancellationToken::new();
        let trader = Arc::new(TraderEngine::new(
            ledger.clone(),
            exchange.clone(),
            bus.clone(),
            TraderSettings {
                symbol: "BTCBRL".to_string(),
                base_asset: "BTC".to_string(),
                quote_asset: "BRL".to_string(),
                cancel_on_expiry: true,
            },
            Arc::new(DashMap::new()),
            halt.clone(),
        ));
        Fixture {
            ledger,
            exchange,
            bus,
            trader,
            halt,
        }
    }

    fn spec(validity_days: i64) -> ObjectSpec {
        ObjectSpec {
            name: "Lote 1".to_string(),
            quantity: 1.0,
            value: 100.0,
            buy_price: 100.0,
            sell_price: 105.0,
            min_appreciation: 0.05,
            validity_days,
        }
    }

    async fn backdate(ledger: &InventoryLedger, holding_id: i64, days: i64) {
        sqlx::query("UPDATE holdings SET purchase_date = ? WHERE id = ?")
            .bind(Utc::now() - ChronoDuration::days(days))
            .bind(holding_id)
            .execute(ledger.database().pool())
            .await
            .unwrap();
    }

    #[test]
    fn test_evaluate_rules() {
        let object = PurchaseObject {
            id: 1,
            name: "lot".to_string(),
            quantity: 1.0,
            value: 0.0,
            buy_price: 0.0,
            sell_price: 0.0,
            min_appreciation: 0.05,
            validity_days: 1,
        };
        let now = Utc::now();
        let holding = Holding {
            id: 1,
            object_id: 1,
            quantity: 1.0,
            purchase_price: 100.0,
            purchase_date: now - ChronoDuration::hours(1),
            sale_price: None,
            sale_date: None,
            purchase_order_id: "b".to_string(),
            sale_order_id: None,
            status: HoldingStatus::Open,
            created_date: now,
        };

        assert_eq!(evaluate(&holding, &object, 104.0, now, true), Decision::Hold);
        assert_eq!(evaluate(&holding, &object, 105.0001, now, true), Decision::Sell);

        let old = Holding {
            purchase_date: now - ChronoDuration::days(2),
            ..holding.clone()
        };
        assert_eq!(evaluate(&old, &object, 104.0, now, true), Decision::Expire);
        assert_eq!(evaluate(&old, &object, 104.0, now, false), Decision::Hold);
        // appreciation wins over expiry
        assert_eq!(evaluate(&old, &object, 106.0, now, true), Decision::Sell);

        let forever = PurchaseObject {
            validity_days: 0,
            ..object
        };
        assert_eq!(evaluate(&old, &forever, 104.0, now, true), Decision::Hold);
    }

    #[tokio::test]
    async fn test_sells_exactly_once_when_threshold_reached() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        let holding = f.trader.buy(object_id).await.unwrap();
        assert_eq!(holding.purchase_price, 100.0);

        let report = f.trader.scan(104.0).await;
        assert_eq!(report.sold, 0);
        assert_eq!(f.exchange.sells(), 0);

        f.exchange.set_price(105.0001);
        let report = f.trader.scan(105.0001).await;
        assert_eq!(report.sold, 1);

        let report = f.trader.scan(105.0001).await;
        assert_eq!(report.evaluated, 0);
        assert_eq!(f.exchange.sells(), 1);

        let sold = f.ledger.get_holding(holding.id).await.unwrap();
        assert_eq!(sold.status, HoldingStatus::Sold);
        assert_eq!(sold.sale_price, Some(105.0001));
        assert_eq!(f.ledger.operations_for(holding.id).await.unwrap().len(), 2);
        assert_eq!(f.trader.stats().sells, 1);
    }

    #[tokio::test]
    async fn test_expiry_cancels_once() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(1)).await.unwrap();
        let holding = f.trader.buy(object_id).await.unwrap();
        backdate(&f.ledger, holding.id, 2).await;

        let report = f.trader.scan(101.0).await;
        assert_eq!(report.cancelled, 1);
        let report = f.trader.scan(101.0).await;
        assert_eq!(report, ScanReport::default());

        let cancelled = f.ledger.get_holding(holding.id).await.unwrap();
        assert_eq!(cancelled.status, HoldingStatus::Cancelled);
        assert_eq!(f.ledger.operations_for(holding.id).await.unwrap().len(), 2);
        assert_eq!(f.exchange.sells(), 0);
    }

    #[tokio::test]
    async fn test_rejected_sell_retried_next_cycle() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        let holding = f.trader.buy(object_id).await.unwrap();

        f.exchange.fail_next_sell(ExchangeError::RejectedOrder("MIN_NOTIONAL".into()));
        let report = f.trader.scan(110.0).await;
        assert_eq!(report.rejected, 1);
        assert!(f.ledger.get_holding(holding.id).await.unwrap().is_open());
        assert_eq!(f.ledger.operations_for(holding.id).await.unwrap().len(), 1);

        let report = f.trader.scan(110.0).await;
        assert_eq!(report.sold, 1);
        assert_eq!(f.trader.stats().rejected_orders, 1);
    }

    #[tokio::test]
    async fn test_one_failing_holding_does_not_block_others() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        f.trader.buy(object_id).await.unwrap();
        f.trader.buy(object_id).await.unwrap();

        f.exchange.fail_next_sell(ExchangeError::Network("connection reset".into()));
        let report = f.trader.scan(110.0).await;
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.sold, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(f.ledger.get_open_holdings().await.unwrap().len(), 1);
        assert!(!f.halt.is_cancelled());
    }

    #[tokio::test]
    async fn test_operator_sell_races_auto_sell() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        let holding = f.trader.buy(object_id).await.unwrap();

        f.exchange.set_price(120.0);
        f.exchange.set_fill_delay(Duration::from_millis(50));

        let auto = {
            let trader = f.trader.clone();
            tokio::spawn(async move { trader.scan(120.0).await })
        };
        let manual = {
            let trader = f.trader.clone();
            tokio::spawn(async move { trader.sell(holding.id).await })
        };
        let report = auto.await.unwrap();
        let manual = manual.await.unwrap();

        assert_eq!(report.sold + manual.is_ok() as usize, 1);
        assert_eq!(f.exchange.sells(), 1);
        let ops = f.ledger.operations_for(holding.id).await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(f.ledger.get_holding(holding.id).await.unwrap().status, HoldingStatus::Sold);
    }

    #[tokio::test]
    async fn test_operator_sell_of_closed_holding_fails() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        let holding = f.trader.buy(object_id).await.unwrap();
        f.trader.sell(holding.id).await.unwrap();

        assert!(matches!(
            f.trader.sell(holding.id).await,
            Err(LedgerError::InvalidState(_))
        ));
        assert_eq!(f.exchange.sells(), 1);
    }

    #[tokio::test]
    async fn test_sale_preview() {
        let f = fixture(200.0).await;
        let object_id = f
            .ledger
            .define_object(&ObjectSpec {
                quantity: 0.5,
                ..spec(7)
            })
            .await
            .unwrap();
        let holding = f.trader.buy(object_id).await.unwrap();

        f.exchange.set_price(220.0);
        let preview = f.trader.sale_preview(holding.id).await.unwrap();
        assert_eq!(preview.cost, 100.0);
        assert_eq!(preview.current_value, 110.0);
        assert!((preview.gain - 10.0).abs() < 1e-9);
        assert_eq!(f.exchange.sells(), 0);
    }

    #[tokio::test]
    async fn test_failed_buy_leaves_no_trace() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        f.exchange.fail_next_buy(ExchangeError::InsufficientFunds("BRL".into()));

        assert!(f.trader.buy(object_id).await.is_err());
        assert!(f.ledger.list_holdings(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_halts() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        f.trader.buy(object_id).await.unwrap();

        f.exchange.fail_next_sell(ExchangeError::Auth("key revoked".into()));
        let report = f.trader.scan(110.0).await;
        assert_eq!(report.failed, 1);
        assert!(f.halt.is_cancelled());
    }

    #[tokio::test]
    async fn test_auth_failure_on_operator_sell_halts() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        let holding = f.trader.buy(object_id).await.unwrap();

        f.exchange.fail_next_sell(ExchangeError::Auth("key revoked".into()));
        assert!(matches!(
            f.trader.sell(holding.id).await,
            Err(LedgerError::Exchange(ExchangeError::Auth(_)))
        ));
        assert!(f.halt.is_cancelled());
        assert!(f.ledger.get_holding(holding.id).await.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_auth_failure_on_sale_preview_halts() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        let holding = f.trader.buy(object_id).await.unwrap();

        f.exchange.fail_next_quote(ExchangeError::Network("timeout".into()));
        assert!(f.trader.sale_preview(holding.id).await.is_err());
        assert!(!f.halt.is_cancelled());

        f.exchange.fail_next_quote(ExchangeError::Auth("key revoked".into()));
        assert!(f.trader.sale_preview(holding.id).await.is_err());
        assert!(f.halt.is_cancelled());
    }

    #[tokio::test]
    async fn test_unrepresentable_validity_never_expires() {
        let f = fixture(100.0).await;
        let huge = f.ledger.define_object(&spec(7)).await.unwrap();
        // row written before validity was bounded
        sqlx::query("UPDATE purchase_objects SET validity_days = ? WHERE id = ?")
            .bind(200_000_000_000_000_i64)
            .bind(huge)
            .execute(f.ledger.database().pool())
            .await
            .unwrap();
        let expiring = f.ledger.define_object(&spec(1)).await.unwrap();

        let kept = f.trader.buy(huge).await.unwrap();
        let stale = f.trader.buy(expiring).await.unwrap();
        backdate(&f.ledger, kept.id, 400).await;
        backdate(&f.ledger, stale.id, 2).await;

        let report = f.trader.scan(101.0).await;
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.cancelled, 1);
        assert!(f.ledger.get_holding(kept.id).await.unwrap().is_open());
        assert_eq!(
            f.ledger.get_holding(stale.id).await.unwrap().status,
            HoldingStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_scan_settles_many_holdings_independently() {
        let f = fixture(100.0).await;
        let selling = f.ledger.define_object(&spec(7)).await.unwrap();
        let expiring = f
            .ledger
            .define_object(&ObjectSpec {
                min_appreciation: 0.5,
                ..spec(1)
            })
            .await
            .unwrap();
        let waiting = f
            .ledger
            .define_object(&ObjectSpec {
                min_appreciation: 0.5,
                ..spec(7)
            })
            .await
            .unwrap();

        let mut sellable = Vec::new();
        for _ in 0..20 {
            sellable.push(f.trader.buy(selling).await.unwrap().id);
        }
        let mut stale = Vec::new();
        for _ in 0..10 {
            let id = f.trader.buy(expiring).await.unwrap().id;
            backdate(&f.ledger, id, 2).await;
            stale.push(id);
        }
        for _ in 0..10 {
            f.trader.buy(waiting).await.unwrap();
        }

        for _ in 0..5 {
            f.exchange.fail_next_sell(ExchangeError::RejectedOrder("MIN_NOTIONAL".into()));
        }
        f.exchange.set_fill_delay(Duration::from_millis(2));

        let report = f.trader.scan(110.0).await;
        assert_eq!(report.evaluated, 40);
        assert_eq!(report.sold, 15);
        assert_eq!(report.rejected, 5);
        assert_eq!(report.cancelled, 10);
        assert_eq!(report.failed + report.skipped, 0);

        let report = f.trader.scan(110.0).await;
        assert_eq!(report.evaluated, 15);
        assert_eq!(report.sold, 5);
        assert_eq!(report.cancelled, 0);

        assert_eq!(f.exchange.sells(), 20);
        for id in sellable {
            let holding = f.ledger.get_holding(id).await.unwrap();
            assert_eq!(holding.status, HoldingStatus::Sold);
            assert_eq!(f.ledger.operations_for(id).await.unwrap().len(), 2);
        }
        for id in stale {
            assert_eq!(
                f.ledger.get_holding(id).await.unwrap().status,
                HoldingStatus::Cancelled
            );
        }
        assert_eq!(f.ledger.get_open_holdings().await.unwrap().len(), 10);
        assert!(!f.halt.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_scans_new_quotes_until_cancelled() {
        let f = fixture(100.0).await;
        let object_id = f.ledger.define_object(&spec(7)).await.unwrap();
        f.trader.buy(object_id).await.unwrap();
        let mut events = f.bus.subscribe();

        let (tx, rx) = watch::channel(None);
        let token = CancellationToken::new();
        let handle = tokio::spawn(f.trader.clone().run(rx, token.clone()));

        tx.send_replace(Some(Quote {
            price: 110.0,
            timestamp: Utc::now(),
            version: 1,
        }));

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(EngineEvent::InventoryChanged { holdings }) = events.recv().await {
                    if holdings.is_empty() {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        token.cancel();
        handle.await.unwrap();
        assert_eq!(f.exchange.sells(), 1);
        assert_eq!(f.trader.stats().cycles_completed, 1);
    }
}
