//! Close strategy trait, selection, and the per-leg context both strategies share.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::hybrid::HybridStrategy;
use super::price_cache::PriceCache;
use super::safe_close::{emergency_close, safe_close};
use super::types::{CloseOptions, CloseResult, LegClose, LegRole};
use super::ultra_fast::UltraFastStrategy;
use crate::config::CloseConfig;
use crate::error::CloseError;
use crate::exchange::{
    get_capabilities, ExchangeCapabilities, ExchangeConnector, PositionSide, SymbolLimits,
};

/// A way of closing a primary position and its hedge.
///
/// Whatever happens inside, `close_positions` returns with both legs closed
/// or with `success == false` and both flags false.
#[async_trait]
pub trait CloseStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Typical wall-clock time of a close, for reporting.
    fn avg_close_time_ms(&self) -> u64;

    /// Whether the strategy can run against the configured exchanges.
    fn is_supported(&self) -> bool;

    async fn close_positions(&self, options: &CloseOptions) -> CloseResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    UltraFast,
    Hybrid,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::UltraFast => write!(f, "ultra_fast"),
            StrategyKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Ultra-Fast needs push order updates on both exchanges; anything else
/// closes with Hybrid.
pub fn select_strategy_kind(primary_exchange: &str, hedge_exchange: &str) -> StrategyKind {
    if get_capabilities(primary_exchange).push_order_updates
        && get_capabilities(hedge_exchange).push_order_updates
    {
        StrategyKind::UltraFast
    } else {
        StrategyKind::Hybrid
    }
}

/// Builds close strategies for exchange pairs.
///
/// Ultra-Fast strategies share the factory's price cache so push price
/// streams are started once per process.
pub struct StrategyFactory {
    config: CloseConfig,
    price_cache: Arc<PriceCache>,
}

impl StrategyFactory {
    pub fn new(config: CloseConfig) -> Self {
        Self::with_price_cache(config, Arc::new(PriceCache::new()))
    }

    pub fn with_price_cache(config: CloseConfig, price_cache: Arc<PriceCache>) -> Self {
        Self {
            config,
            price_cache,
        }
    }

    pub fn price_cache(&self) -> Arc<PriceCache> {
        self.price_cache.clone()
    }

    pub fn select_strategy(
        &self,
        primary: Arc<dyn ExchangeConnector>,
        hedge: Arc<dyn ExchangeConnector>,
    ) -> Box<dyn CloseStrategy> {
        let kind = select_strategy_kind(&primary.exchange_name(), &hedge.exchange_name());
        info!(
            primary = %primary.exchange_name(),
            hedge = %hedge.exchange_name(),
            strategy = %kind,
            "Selected close strategy"
        );

        match kind {
            StrategyKind::UltraFast => Box::new(UltraFastStrategy::new(
                primary,
                hedge,
                self.config.clone(),
                self.price_cache.clone(),
            )),
            StrategyKind::Hybrid => {
                Box::new(HybridStrategy::new(primary, hedge, self.config.clone()))
            }
        }
    }
}

/// One side of a close: where it lives and what is believed to be open.
pub(crate) struct LegContext {
    pub role: LegRole,
    pub connector: Arc<dyn ExchangeConnector>,
    pub exchange: String,
    pub capabilities: ExchangeCapabilities,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
}

impl LegContext {
    pub fn new(
        role: LegRole,
        connector: Arc<dyn ExchangeConnector>,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Self {
        let exchange = connector.exchange_name();
        Self {
            role,
            capabilities: get_capabilities(&exchange),
            connector,
            exchange,
            symbol: symbol.to_string(),
            side,
            quantity,
        }
    }

    /// Primary and hedge legs for a request.
    pub fn pair(
        primary: &Arc<dyn ExchangeConnector>,
        hedge: &Arc<dyn ExchangeConnector>,
        options: &CloseOptions,
    ) -> (Self, Self) {
        (
            Self::new(
                LegRole::Primary,
                primary.clone(),
                &options.primary_symbol,
                options.primary_side,
                options.quantity,
            ),
            Self::new(
                LegRole::Hedge,
                hedge.clone(),
                &options.hedge_symbol,
                options.hedge_side(),
                options.quantity,
            ),
        )
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.exchange, self.symbol)
    }

    /// Refresh side and size from the exchange. Returns false when the leg
    /// is already flat; an unreadable position keeps the requested values.
    pub async fn refresh_open(&mut self) -> bool {
        match self.connector.get_position(&self.symbol).await {
            Ok(position) => match PositionSide::from_signed_size(position.size) {
                None => {
                    info!(leg = %self.role, exchange = %self.exchange, symbol = %self.symbol, "Leg already flat");
                    false
                }
                Some(side) => {
                    self.side = side;
                    self.quantity = position.size.abs();
                    true
                }
            },
            Err(e) => {
                warn!(leg = %self.role, exchange = %self.exchange, error = %e, "Position pre-check failed, assuming open");
                true
            }
        }
    }

    /// Symbol limits for price rounding; unknown limits leave prices unrounded.
    pub async fn limits(&self) -> SymbolLimits {
        match self.connector.get_symbol_limits(&self.symbol).await {
            Ok(limits) => limits,
            Err(e) => {
                debug!(exchange = %self.exchange, symbol = %self.symbol, error = %e, "No symbol limits, prices unrounded");
                SymbolLimits::default()
            }
        }
    }

    /// Cancel a resting order, then safe-close whatever remains.
    pub async fn cancel_and_safe_close(&self, order_id: Option<&str>) -> Result<LegClose, CloseError> {
        if let Some(order_id) = order_id {
            if let Err(e) = self.connector.cancel_order(order_id, &self.symbol).await {
                // Usually means it filled meanwhile; the safe close re-reads the position
                warn!(leg = %self.role, exchange = %self.exchange, %order_id, error = %e, "Cancel failed");
            }
        }
        safe_close(self.connector.as_ref(), &self.symbol, self.side, self.quantity).await
    }

    /// Best-effort cancel of a resting order.
    pub async fn cancel_quietly(&self, order_id: &str) {
        if let Err(e) = self.connector.cancel_order(order_id, &self.symbol).await {
            warn!(leg = %self.role, exchange = %self.exchange, %order_id, error = %e, "Cancel failed");
        }
    }
}

/// Emergency close of a leg pair after a strategy error.
pub(crate) async fn emergency_close_pair(
    strategy: &str,
    primary: &LegContext,
    hedge: &LegContext,
    cause: &str,
    started: Instant,
) -> CloseResult {
    emergency_close(
        strategy,
        (
            primary.connector.as_ref(),
            &primary.symbol,
            primary.side,
            primary.quantity,
        ),
        (
            hedge.connector.as_ref(),
            &hedge.symbol,
            hedge.side,
            hedge.quantity,
        ),
        cause,
        started,
    )
    .await
}
