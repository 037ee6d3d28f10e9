//! Engine event fan-out
//!
//! Publishers never wait on observers: every subscriber owns its own queue
//! and `publish` only pushes into it. Subscribers that went away are pruned
//! on the next publish. The last price and balance are also kept in `watch`
//! cells for readers that only care about the latest value.
//!
//! A subscriber that falls behind stops receiving price and balance updates
//! until it drains its backlog; the cells still hold the latest values. One
//! that falls [`MAX_QUEUED`] events behind is disconnected.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::types::{Balances, HoldingSnapshot};

/// Backlog above which price and balance updates are coalesced
pub const COALESCE_AFTER: usize = 64;
/// Backlog at which a subscriber is dropped
pub const MAX_QUEUED: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PriceUpdated {
        price: f64,
        timestamp: DateTime<Utc>,
    },
    BalanceUpdated {
        btc_balance: f64,
        fiat_balance: f64,
    },
    InventoryChanged {
        holdings: Vec<HoldingSnapshot>,
    },
    LogLine {
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker stopped on a fatal error
    Halted {
        reason: String,
    },
}

impl EngineEvent {
    /// Only the latest value matters
    fn is_coalescable(&self) -> bool {
        matches!(
            self,
            EngineEvent::PriceUpdated { .. } | EngineEvent::BalanceUpdated { .. }
        )
    }
}

/// Receiving end of one subscription
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    queued: Arc<AtomicUsize>,
}

impl EventStream {
    /// Next event, or None once the bus dropped this subscriber
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }

    pub fn try_recv(&mut self) -> Result<EngineEvent, TryRecvError> {
        let event = self.rx.try_recv()?;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        Ok(event)
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<EngineEvent>,
    queued: Arc<AtomicUsize>,
}

impl Subscriber {
    /// False when the subscriber is gone or hopelessly behind
    fn deliver(&self, event: &EngineEvent) -> bool {
        let backlog = self.queued.load(Ordering::Acquire);
        if backlog >= MAX_QUEUED {
            warn!("Dropping event subscriber with {} undelivered events", backlog);
            return false;
        }
        if backlog >= COALESCE_AFTER && event.is_coalescable() {
            return !self.tx.is_closed();
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.tx.send(event.clone()).is_ok()
    }
}

pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    latest_price: watch::Sender<Option<f64>>,
    latest_balances: watch::Sender<Option<Balances>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (latest_price, _) = watch::channel(None);
        let (latest_balances, _) = watch::channel(None);
        Self {
            subscribers: Mutex::new(Vec::new()),
            latest_price,
            latest_balances,
        }
    }

    /// New subscriber queue. Receives every event published after this call.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        self.subscribers.lock().push(Subscriber {
            tx,
            queued: queued.clone(),
        });
        EventStream { rx, queued }
    }

    pub fn publish(&self, event: EngineEvent) {
        match &event {
            EngineEvent::PriceUpdated { price, .. } => {
                self.latest_price.send_replace(Some(*price));
            }
            EngineEvent::BalanceUpdated {
                btc_balance,
                fiat_balance,
            } => {
                self.latest_balances.send_replace(Some(Balances {
                    base: *btc_balance,
                    quote: *fiat_balance,
                }));
            }
            _ => {}
        }

        self.subscribers.lock().retain(|sub| sub.deliver(&event));
    }

    /// Log through tracing and forward the line to observers
    pub fn log(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        self.publish(EngineEvent::LogLine {
            text,
            timestamp: Utc::now(),
        });
    }

    pub fn log_warn(&self, text: impl Into<String>) {
        let text = text.into();
        warn!("{}", text);
        self.publish(EngineEvent::LogLine {
            text,
            timestamp: Utc::now(),
        });
    }

    pub fn latest_price(&self) -> Option<f64> {
        *self.latest_price.borrow()
    }

    pub fn latest_balances(&self) -> Option<Balances> {
        *self.latest_balances.borrow()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(EngineEvent::PriceUpdated {
            price: 10.0,
            timestamp: Utc::now(),
        });
        bus.log("scan done");

        for rx in [&mut a, &mut b] {
            assert!(matches!(
                rx.recv().await,
                Some(EngineEvent::PriceUpdated { price, .. }) if price == 10.0
            ));
            assert!(matches!(
                rx.recv().await,
                Some(EngineEvent::LogLine { ref text, .. }) if text == "scan done"
            ));
        }
        assert_eq!(bus.latest_price(), Some(10.0));
    }

    #[test]
    fn test_slow_or_gone_subscribers_never_block() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe();
        let gone = bus.subscribe();
        drop(gone);

        // nobody reads `slow`; publish must still return immediately
        for i in 0..10_000 {
            bus.publish(EngineEvent::BalanceUpdated {
                btc_balance: i as f64,
                fiat_balance: 0.0,
            });
        }

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.latest_balances().map(|b| b.base), Some(9_999.0));

        // backlog stays at the coalescing threshold
        let mut backlog = 0;
        while slow.try_recv().is_ok() {
            backlog += 1;
        }
        assert_eq!(backlog, COALESCE_AFTER);
    }

    #[test]
    fn test_lagging_subscriber_keeps_inventory_and_logs() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe();

        for i in 0..COALESCE_AFTER {
            bus.log(format!("line {}", i));
        }
        bus.publish(EngineEvent::PriceUpdated {
            price: 1.0,
            timestamp: Utc::now(),
        });
        bus.publish(EngineEvent::InventoryChanged { holdings: vec![] });

        let mut received = Vec::new();
        while let Ok(event) = slow.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), COALESCE_AFTER + 1);
        assert!(matches!(received.last(), Some(EngineEvent::InventoryChanged { .. })));
        assert!(!received
            .iter()
            .any(|e| matches!(e, EngineEvent::PriceUpdated { .. })));
        assert_eq!(bus.latest_price(), Some(1.0));

        // drained, so price updates flow again
        bus.publish(EngineEvent::PriceUpdated {
            price: 2.0,
            timestamp: Utc::now(),
        });
        let resumed = slow.try_recv();
        assert!(matches!(resumed, Ok(EngineEvent::PriceUpdated { price, .. }) if price == 2.0));
    }

    #[tokio::test]
    async fn test_subscriber_dropped_past_max_backlog() {
        let bus = EventBus::new();
        let mut stalled = bus.subscribe();
        let mut live = bus.subscribe();

        for i in 0..=MAX_QUEUED {
            bus.log(format!("line {}", i));
            while live.try_recv().is_ok() {}
        }
        assert_eq!(bus.subscriber_count(), 1);

        let mut drained = 0;
        while stalled.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, MAX_QUEUED);
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let json = serde_json::to_value(EngineEvent::Halted {
            reason: "invalid key".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "halted");
        assert_eq!(json["reason"], "invalid key");

        let json = serde_json::to_value(EngineEvent::BalanceUpdated {
            btc_balance: 0.5,
            fiat_balance: 100.0,
        })
        .unwrap();
        assert_eq!(json["type"], "balance_updated");
        assert_eq!(json["btc_balance"], 0.5);
    }
}
