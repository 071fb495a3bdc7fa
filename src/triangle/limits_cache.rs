//! Process-wide cache of exchange symbol limits.

use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::exchange::{ExchangeConnector, SymbolLimits};

/// Symbol limits keyed by (exchange, symbol).
///
/// Entries are fetched lazily on first use and kept for the process
/// lifetime. Concurrent misses for the same key may both fetch; the last
/// write wins, which is harmless since limits are static.
#[derive(Debug, Default)]
pub struct SymbolLimitsCache {
    entries: RwLock<HashMap<(String, String), SymbolLimits>>,
}

impl SymbolLimitsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, exchange: &str, symbol: &str) -> Option<SymbolLimits> {
        self.entries
            .read()
            .await
            .get(&(exchange.to_string(), symbol.to_string()))
            .copied()
    }

    pub async fn insert(&self, exchange: &str, symbol: &str, limits: SymbolLimits) {
        self.entries
            .write()
            .await
            .insert((exchange.to_string(), symbol.to_string()), limits);
    }

    /// Cached limits, fetching from the connector on a miss.
    pub async fn get_or_fetch(
        &self,
        connector: &dyn ExchangeConnector,
        symbol: &str,
    ) -> Result<SymbolLimits> {
        let exchange = connector.exchange_name();
        if let Some(limits) = self.get(&exchange, symbol).await {
            return Ok(limits);
        }

        let limits = connector
            .get_symbol_limits(symbol)
            .await
            .with_context(|| format!("Failed to fetch symbol limits for {}", symbol))?;

        debug!(%exchange, %symbol, ?limits, "Cached symbol limits");
        self.insert(&exchange, symbol, limits).await;
        Ok(limits)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
