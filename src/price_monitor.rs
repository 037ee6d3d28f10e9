//! Price monitor - polls the exchange quote and publishes it
//!
//! The monitor is the only writer of the current quote. Readers get it
//! through a `watch` channel (atomic snapshot, latest value wins) and as
//! `PriceUpdated` events on the bus.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event_bus::{EngineEvent, EventBus};
use crate::exchange::ExchangeClient;
use crate::retry::{Backoff, BackoffPolicy};
use crate::types::Quote;

pub type QuoteReceiver = watch::Receiver<Option<Quote>>;

pub struct PriceMonitor {
    quotes: QuoteReceiver,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PriceMonitor {
    /// Start polling `symbol` every `interval`.
    ///
    /// `shutdown` is the engine-wide token: cancelling it stops the monitor,
    /// and the monitor cancels it itself on an authentication failure.
    pub fn spawn(
        exchange: Arc<dyn ExchangeClient>,
        bus: Arc<EventBus>,
        symbol: String,
        interval: Duration,
        policy: BackoffPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        let token = shutdown.child_token();
        let (tx, quotes) = watch::channel(None);

        let handle = tokio::spawn(poll_loop(
            exchange,
            bus,
            symbol,
            interval,
            policy,
            tx,
            token.clone(),
            shutdown,
        ));

        Self {
            quotes,
            token,
            handle,
        }
    }

    pub fn subscribe(&self) -> QuoteReceiver {
        self.quotes.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the loop to exit. Nothing is published afterwards.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Price monitor task ended abnormally: {}", e);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    exchange: Arc<dyn ExchangeClient>,
    bus: Arc<EventBus>,
    symbol: String,
    interval: Duration,
    policy: BackoffPolicy,
    tx: watch::Sender<Option<Quote>>,
    token: CancellationToken,
    shutdown: CancellationToken,
) {
    info!("Price monitor started for {} every {:?} via {}", symbol, interval, exchange.name());

    let mut backoff = Backoff::new(policy);
    let mut version: u64 = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            r = exchange.get_quote(&symbol) => r,
        };

        let delay = match result {
            Ok(price) => {
                if token.is_cancelled() {
                    break;
                }
                version += 1;
                let quote = Quote {
                    price,
                    timestamp: Utc::now(),
                    version,
                };
                tx.send_replace(Some(quote));
                bus.publish(EngineEvent::PriceUpdated {
                    price,
                    timestamp: quote.timestamp,
                });
                if backoff.attempt() > 0 {
                    bus.log(format!(
                        "Quote feed recovered after {} failed attempts",
                        backoff.attempt()
                    ));
                    backoff.reset();
                }
                debug!("{} quote #{}: {:.2}", symbol, version, price);
                interval
            }
            Err(e) if e.is_fatal() => {
                bus.log_warn(format!("Price monitor halted: {}", e));
                bus.publish(EngineEvent::Halted {
                    reason: e.to_string(),
                });
                shutdown.cancel();
                break;
            }
            Err(e) => {
                let delay = backoff.next_backoff();
                warn!(
                    "Quote for {} failed (attempt {}): {}; retrying in {:?}",
                    symbol,
                    backoff.attempt(),
                    e,
                    delay
                );
                delay
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Price monitor stopped after {} quotes", version);
}
