//! Trading Engine - owns the background workers
//!
//! start() connects the exchange, spawns the price monitor and the trader
//! loop; stop() cancels both and waits until they have exited. Operator
//! commands go through here so they share the trader's per-holding locks.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config_manager::{ConfigError, ConfigManager, SettingsUpdate, TraderConfig};
use crate::db::{Holding, HoldingStatus, ObjectSpec, Operation, PurchaseObject};
use crate::event_bus::EventBus;
use crate::exchange::{BinanceClient, ExchangeClient, ExchangeError, PaperExchange};
use crate::ledger::{InventoryLedger, LedgerError};
use crate::price_monitor::PriceMonitor;
use crate::retry::BackoffPolicy;
use crate::trader_loop::{HoldingLocks, TraderEngine, TraderSettings};
use crate::types::{Balances, Performance, SalePreview, TraderStats};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine is already running")]
    AlreadyRunning,
    #[error("Engine is not running")]
    NotRunning,
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub is_running: bool,
    /// Workers stopped on a fatal error and stop() has not been called yet
    pub halted: bool,
    pub exchange: Option<String>,
    pub symbol: String,
    pub started_at: Option<DateTime<Utc>>,
    pub latest_price: Option<f64>,
    pub latest_balances: Option<Balances>,
    pub stats: TraderStats,
    pub subscribers: usize,
}

struct Workers {
    shutdown: CancellationToken,
    monitor: PriceMonitor,
    trader: JoinHandle<()>,
}

impl Workers {
    /// Halted on a fatal error, or a task exited on its own
    fn has_stopped(&self) -> bool {
        self.shutdown.is_cancelled() || self.monitor.is_finished() || self.trader.is_finished()
    }

    async fn join(self) {
        self.shutdown.cancel();
        self.monitor.stop().await;
        if let Err(e) = self.trader.await {
            warn!("Trader task ended abnormally: {}", e);
        }
    }
}

pub struct TradingEngine {
    ledger: Arc<InventoryLedger>,
    bus: Arc<EventBus>,
    config_manager: Arc<ConfigManager>,
    holding_locks: HoldingLocks,
    backoff: BackoffPolicy,

    // Running state
    workers: Mutex<Option<Workers>>,
    trader: RwLock<Option<Arc<TraderEngine>>>,
    shutdown: RwLock<Option<CancellationToken>>,
    is_running: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl TradingEngine {
    pub fn new(
        ledger: Arc<InventoryLedger>,
        bus: Arc<EventBus>,
        config_manager: Arc<ConfigManager>,
    ) -> Self {
        Self {
            ledger,
            bus,
            config_manager,
            holding_locks: Arc::new(DashMap::new()),
            backoff: BackoffPolicy::default(),
            workers: Mutex::new(None),
            trader: RwLock::new(None),
            shutdown: RwLock::new(None),
            is_running: AtomicBool::new(false),
            started_at: RwLock::new(None),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn ledger(&self) -> &Arc<InventoryLedger> {
        &self.ledger
    }

    pub fn config(&self) -> TraderConfig {
        self.config_manager.get_config()
    }

    /// Connect to the configured exchange and start the workers
    pub async fn start(&self) -> Result<(), EngineError> {
        let config = self.config_manager.get_config();
        config.validate()?;
        let credentials = config.credentials()?;

        let live = Arc::new(BinanceClient::new(
            credentials.api_key,
            credentials.api_secret,
            config.base_url()?,
            config.timeout(),
            config.quantity_precision,
        )?);

        let exchange: Arc<dyn ExchangeClient> = if config.paper_trading {
            let balances = self.paper_balances(config.paper_quote_balance).await?;
            Arc::new(PaperExchange::with_quote_source(live, balances))
        } else {
            live
        };

        self.start_with_exchange(exchange).await
    }

    /// Paper account holding the base asset of every open lot, so lots
    /// restored from an earlier run can still be sold
    async fn paper_balances(&self, quote: f64) -> Result<Balances, EngineError> {
        let base = self
            .ledger
            .get_open_holdings()
            .await?
            .iter()
            .map(|h| h.quantity)
            .sum();
        Ok(Balances { base, quote })
    }

    /// Start the workers against an already constructed exchange client
    pub async fn start_with_exchange(
        &self,
        exchange: Arc<dyn ExchangeClient>,
    ) -> Result<(), EngineError> {
        let config = self.config_manager.get_config();
        config.validate()?;
        config.credentials()?;

        let mut workers = self.workers.lock().await;
        if let Some(previous) = workers.take() {
            if !previous.has_stopped() {
                *workers = Some(previous);
                return Err(EngineError::AlreadyRunning);
            }
            // halted or died; reap before restarting
            previous.join().await;
        }

        info!("Starting trading engine on {} ({})...", exchange.name(), config.symbol);

        let shutdown = CancellationToken::new();
        let trader = Arc::new(TraderEngine::new(
            self.ledger.clone(),
            exchange.clone(),
            self.bus.clone(),
            TraderSettings {
                symbol: config.symbol.clone(),
                base_asset: config.base_asset.clone(),
                quote_asset: config.quote_asset.clone(),
                cancel_on_expiry: config.cancel_on_expiry,
            },
            self.holding_locks.clone(),
            shutdown.clone(),
        ));

        let monitor = PriceMonitor::spawn(
            exchange,
            self.bus.clone(),
            config.symbol.clone(),
            config.poll_interval(),
            self.backoff,
            shutdown.clone(),
        );
        let trader_handle =
            tokio::spawn(trader.clone().run(monitor.subscribe(), shutdown.child_token()));

        *workers = Some(Workers {
            shutdown: shutdown.clone(),
            monitor,
            trader: trader_handle,
        });
        *self.trader.write() = Some(trader);
        *self.shutdown.write() = Some(shutdown);
        *self.started_at.write() = Some(Utc::now());
        self.is_running.store(true, Ordering::SeqCst);

        self.bus.log(format!(
            "Engine started: polling {} every {:?}",
            config.symbol,
            config.poll_interval()
        ));
        Ok(())
    }

    /// Stop both workers and wait for them. An in-flight scan completes first.
    pub async fn stop(&self) {
        let workers = self.workers.lock().await.take();
        let Some(workers) = workers else {
            return;
        };

        info!("Stopping trading engine...");
        workers.join().await;

        self.is_running.store(false, Ordering::SeqCst);
        *self.started_at.write() = None;
        self.bus.log("Engine stopped");
    }

    fn is_halted(&self) -> bool {
        let cancelled = self
            .shutdown
            .read()
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false);
        // start/stop hold the lock only briefly; report what the token says meanwhile
        let stopped = self
            .workers
            .try_lock()
            .map(|w| w.as_ref().map(Workers::has_stopped).unwrap_or(false))
            .unwrap_or(false);
        cancelled || stopped
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst) && !self.is_halted()
    }

    pub fn status(&self) -> EngineStatus {
        let trader = self.trader.read().clone();
        let config = self.config_manager.get_config();
        let running = self.is_running.load(Ordering::SeqCst);

        EngineStatus {
            is_running: running && !self.is_halted(),
            halted: running && self.is_halted(),
            exchange: trader.as_ref().map(|t| t.exchange().name().to_string()),
            symbol: config.symbol,
            started_at: *self.started_at.read(),
            latest_price: self.bus.latest_price(),
            latest_balances: self.bus.latest_balances(),
            stats: trader.map(|t| t.stats()).unwrap_or_default(),
            subscribers: self.bus.subscriber_count(),
        }
    }

    /// Change settings; only allowed while stopped
    pub async fn update_settings(
        &self,
        update: SettingsUpdate,
    ) -> Result<TraderConfig, EngineError> {
        let workers = self.workers.lock().await;
        if workers.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        Ok(self.config_manager.update_settings(update)?)
    }

    /// Trader bound to the connected exchange. Survives stop() so the
    /// operator can still settle holdings by hand.
    fn trader(&self) -> Result<Arc<TraderEngine>, EngineError> {
        self.trader.read().clone().ok_or(EngineError::NotRunning)
    }

    // ==========================================
    // Operator Commands
    // ==========================================

    pub async fn define_object(&self, spec: &ObjectSpec) -> Result<PurchaseObject, EngineError> {
        let id = self.ledger.define_object(spec).await?;
        Ok(self.ledger.get_object(id).await?)
    }

    pub async fn list_objects(&self) -> Result<Vec<PurchaseObject>, EngineError> {
        Ok(self.ledger.list_objects().await?)
    }

    pub async fn get_object(&self, id: i64) -> Result<PurchaseObject, EngineError> {
        Ok(self.ledger.get_object(id).await?)
    }

    pub async fn update_object(
        &self,
        id: i64,
        spec: &ObjectSpec,
    ) -> Result<PurchaseObject, EngineError> {
        Ok(self.ledger.update_object(id, spec).await?)
    }

    pub async fn delete_object(&self, id: i64) -> Result<(), EngineError> {
        Ok(self.ledger.delete_object(id).await?)
    }

    pub async fn buy_object(&self, object_id: i64) -> Result<Holding, EngineError> {
        Ok(self.trader()?.buy(object_id).await?)
    }

    pub async fn sell_holding(&self, holding_id: i64) -> Result<f64, EngineError> {
        Ok(self.trader()?.sell(holding_id).await?)
    }

    pub async fn sale_preview(&self, holding_id: i64) -> Result<SalePreview, EngineError> {
        Ok(self.trader()?.sale_preview(holding_id).await?)
    }

    pub async fn get_open_holdings(&self) -> Result<Vec<Holding>, EngineError> {
        Ok(self.ledger.get_open_holdings().await?)
    }

    pub async fn list_holdings(
        &self,
        status: Option<HoldingStatus>,
    ) -> Result<Vec<Holding>, EngineError> {
        Ok(self.ledger.list_holdings(status).await?)
    }

    pub async fn operations_for(&self, holding_id: i64) -> Result<Vec<Operation>, EngineError> {
        Ok(self.ledger.operations_for(holding_id).await?)
    }

    pub async fn performance(&self) -> Result<Performance, EngineError> {
        Ok(self.ledger.performance().await?)
    }
}
