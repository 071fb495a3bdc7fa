//! Push-fed price cache for aggressive limit pricing.

use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::exchange::{ExchangeConnector, PushEvent};

type PriceSlot = Arc<watch::Sender<Option<(Decimal, Instant)>>>;

/// Latest pushed price per (exchange, symbol).
///
/// Each key is fed by at most one forwarding task, started on first use
/// and kept for the life of the exchange's push channel. Readers either
/// take the current value if it is fresh enough or wait for the next one.
#[derive(Default)]
pub struct PriceCache {
    slots: Mutex<HashMap<String, PriceSlot>>,
    streams: Mutex<HashSet<String>>,
}

fn key(exchange: &str, symbol: &str) -> String {
    format!("{}:{}", exchange, symbol)
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, PriceSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashSet<String>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: &str) -> PriceSlot {
        self.lock_slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(watch::channel(None).0))
            .clone()
    }

    pub fn update(&self, exchange: &str, symbol: &str, price: Decimal) {
        self.slot(&key(exchange, symbol))
            .send_replace(Some((price, Instant::now())));
    }

    /// Cached price if it is younger than `max_age`.
    pub fn get_fresh(&self, exchange: &str, symbol: &str, max_age: Duration) -> Option<Decimal> {
        let slot = self.lock_slots().get(&key(exchange, symbol)).cloned()?;
        let value = *slot.borrow();
        value.and_then(|(price, at)| (at.elapsed() <= max_age).then_some(price))
    }

    /// Wait up to `timeout` for a price younger than `max_age`.
    pub async fn wait_for_fresh(
        &self,
        exchange: &str,
        symbol: &str,
        max_age: Duration,
        timeout: Duration,
    ) -> Option<Decimal> {
        let mut rx = self.slot(&key(exchange, symbol)).subscribe();

        let wait = async {
            loop {
                let value = *rx.borrow_and_update();
                if let Some((price, at)) = value {
                    if at.elapsed() <= max_age {
                        return Some(price);
                    }
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    pub fn has_stream(&self, exchange: &str, symbol: &str) -> bool {
        self.lock_streams().contains(&key(exchange, symbol))
    }

    /// Start forwarding the connector's pushed prices for `symbol` into the
    /// cache, unless a forwarder for this key already runs.
    ///
    /// Returns false when the connector has no push channel.
    pub fn ensure_stream(self: &Arc<Self>, connector: &dyn ExchangeConnector, symbol: &str) -> bool {
        let exchange = connector.exchange_name();
        let stream_key = key(&exchange, symbol);

        {
            let mut streams = self.lock_streams();
            if streams.contains(&stream_key) {
                return true;
            }
            let Some(rx) = connector.subscribe() else {
                return false;
            };
            streams.insert(stream_key.clone());
            self.spawn_forwarder(exchange, symbol.to_string(), stream_key, rx);
        }

        true
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        exchange: String,
        symbol: String,
        stream_key: String,
        mut rx: broadcast::Receiver<PushEvent>,
    ) {
        let cache: Weak<Self> = Arc::downgrade(self);
        info!(%exchange, %symbol, "Starting push price stream");

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PushEvent::Price(update)) if update.symbol == symbol => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.update(&exchange, &symbol, update.price);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%exchange, %symbol, skipped, "Price stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(%exchange, %symbol, "Price stream closed");
                        if let Some(cache) = cache.upgrade() {
                            cache.lock_streams().remove(&stream_key);
                        }
                        break;
                    }
                }
            }
        });
    }
}
