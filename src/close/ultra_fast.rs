//! Ultra-Fast close: aggressive limit orders watched over push channels.
//!
//! Both legs get a reduce-only limit order priced just through the market
//! from a fresh pushed price. Fills are watched on the push order channel
//! until the max wait; anything still open is cancelled and safe-closed.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::price_cache::PriceCache;
use super::safe_close::{aggressive_limit_price, is_already_closed_error};
use super::strategy::{emergency_close_pair, CloseStrategy, LegContext};
use super::types::{CloseOptions, CloseResult, FeeType, LegClose};
use crate::config::CloseConfig;
use crate::error::CloseError;
use crate::exchange::{
    get_capabilities, ExchangeConnector, LimitOrderOptions, OrderStatus, PushEvent,
};

const NAME: &str = "ultra_fast";

pub struct UltraFastStrategy {
    primary: Arc<dyn ExchangeConnector>,
    hedge: Arc<dyn ExchangeConnector>,
    config: CloseConfig,
    price_cache: Arc<PriceCache>,
}

/// A limit order accepted by the exchange.
#[derive(Debug, Clone)]
struct PlacedOrder {
    order_id: String,
    price: Decimal,
    /// Reported filled in the placement response itself
    filled: bool,
}

impl UltraFastStrategy {
    pub fn new(
        primary: Arc<dyn ExchangeConnector>,
        hedge: Arc<dyn ExchangeConnector>,
        config: CloseConfig,
        price_cache: Arc<PriceCache>,
    ) -> Self {
        Self {
            primary,
            hedge,
            config,
            price_cache,
        }
    }

    /// Aggressive limit price for an open leg from a fresh pushed price.
    async fn limit_price(
        &self,
        leg: &LegContext,
        open: bool,
        margin: Decimal,
    ) -> Result<Option<Decimal>, CloseError> {
        if !open {
            return Ok(None);
        }

        if !self.price_cache.ensure_stream(leg.connector.as_ref(), &leg.symbol) {
            warn!(exchange = %leg.exchange, symbol = %leg.symbol, "No push channel for prices");
        }

        let price = self
            .price_cache
            .wait_for_fresh(
                &leg.exchange,
                &leg.symbol,
                self.config.price_stale(),
                self.config.price_wait(),
            )
            .await
            .ok_or_else(|| CloseError::PriceUnavailable {
                exchange: leg.exchange.clone(),
                symbol: leg.symbol.clone(),
            })?;

        let limits = leg.limits().await;
        let limit_price =
            aggressive_limit_price(leg.side.closing_side(), price, margin, limits.price_step);
        debug!(leg = %leg.role, %price, %limit_price, "Aggressive limit price");
        Ok(Some(limit_price))
    }

    /// Submit the leg's limit order over push, falling back to REST.
    /// `Ok(None)` means there was nothing to place.
    async fn place(
        &self,
        leg: &LegContext,
        price: Option<Decimal>,
    ) -> Result<Option<PlacedOrder>, CloseError> {
        let Some(price) = price else {
            return Ok(None);
        };

        let side = leg.side.closing_side();
        let options = LimitOrderOptions {
            reduce_only: leg.capabilities.reduce_only,
            post_only: leg.capabilities.post_only,
        };

        let placed = match leg
            .connector
            .place_limit_order_push(&leg.symbol, side, leg.quantity, price, options)
            .await
        {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(leg = %leg.role, error = %e, "Push submission failed, using REST");
                leg.connector
                    .place_limit_order(&leg.symbol, side, leg.quantity, price, options)
                    .await
            }
        };

        match placed {
            Ok(response) => {
                info!(leg = %leg.role, exchange = %leg.exchange, order_id = %response.order_id, %side, quantity = %leg.quantity, %price, "Close order placed");
                Ok(Some(PlacedOrder {
                    filled: response.order_status() == Some(OrderStatus::Filled),
                    order_id: response.order_id,
                    price,
                }))
            }
            Err(e) if is_already_closed_error(&e.to_string()) => {
                info!(leg = %leg.role, exchange = %leg.exchange, "Order rejected, position already closed");
                Ok(None)
            }
            Err(e) => Err(CloseError::Other(
                e.context(format!("{} close order failed", leg.label())),
            )),
        }
    }

    async fn run(
        &self,
        primary: &mut LegContext,
        hedge: &mut LegContext,
        options: &CloseOptions,
    ) -> Result<(LegClose, LegClose), CloseError> {
        let (primary_open, hedge_open) = tokio::join!(primary.refresh_open(), hedge.refresh_open());
        if !primary_open && !hedge_open {
            return Ok((LegClose::already_flat(), LegClose::already_flat()));
        }

        let margin = options
            .aggressive_margin
            .unwrap_or(self.config.aggressive_margin);
        let (primary_price, hedge_price) = tokio::try_join!(
            self.limit_price(primary, primary_open, margin),
            self.limit_price(hedge, hedge_open, margin),
        )?;

        // Subscribe before placing so an immediate fill is not missed
        let mut primary_rx = primary_price.and_then(|_| primary.connector.subscribe());
        let mut hedge_rx = hedge_price.and_then(|_| hedge.connector.subscribe());

        let (primary_order, hedge_order) = tokio::join!(
            self.place(primary, primary_price),
            self.place(hedge, hedge_price),
        );
        let (primary_order, hedge_order) = match (primary_order, hedge_order) {
            (Ok(p), Ok(h)) => (p, h),
            // The accepted leg must not be left resting
            (Err(e), hedge_order) => {
                if let Ok(Some(order)) = hedge_order {
                    hedge.cancel_quietly(&order.order_id).await;
                }
                return Err(e);
            }
            (Ok(primary_order), Err(e)) => {
                if let Some(order) = primary_order {
                    primary.cancel_quietly(&order.order_id).await;
                }
                return Err(e);
            }
        };

        let deadline = tokio::time::Instant::now()
            + options.max_wait.unwrap_or(self.config.ultra_fast_max_wait());
        let (primary_filled, hedge_filled) = tokio::join!(
            wait_for_fill(primary_order.as_ref(), primary_rx.as_mut(), deadline),
            wait_for_fill(hedge_order.as_ref(), hedge_rx.as_mut(), deadline),
        );

        let (primary_close, hedge_close) = tokio::join!(
            finish(primary, primary_order, primary_filled),
            finish(hedge, hedge_order, hedge_filled),
        );
        Ok((primary_close?, hedge_close?))
    }
}

/// Wait until the order is reported filled or the deadline passes.
async fn wait_for_fill(
    order: Option<&PlacedOrder>,
    rx: Option<&mut broadcast::Receiver<PushEvent>>,
    deadline: tokio::time::Instant,
) -> bool {
    let Some(order) = order else {
        return false;
    };
    if order.filled {
        return true;
    }
    let Some(rx) = rx else {
        warn!(order_id = %order.order_id, "No push order channel, cannot watch fill");
        return false;
    };

    let watch = async {
        loop {
            match rx.recv().await {
                Ok(PushEvent::Order(update)) if update.order_id == order.order_id => {
                    match update.status {
                        OrderStatus::Filled => return true,
                        status if status.is_terminal() => {
                            warn!(order_id = %order.order_id, ?status, "Close order ended unfilled");
                            return false;
                        }
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(order_id = %order.order_id, skipped, "Order stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };

    tokio::time::timeout_at(deadline, watch)
        .await
        .unwrap_or(false)
}

/// Settle a leg after the wait: a fill before the deadline is a maker exit,
/// anything else is cancelled and force-closed as taker.
async fn finish(
    leg: &LegContext,
    order: Option<PlacedOrder>,
    filled: bool,
) -> Result<LegClose, CloseError> {
    let Some(order) = order else {
        return Ok(LegClose::already_flat());
    };

    if filled {
        info!(leg = %leg.role, exchange = %leg.exchange, order_id = %order.order_id, price = %order.price, "Close order filled");
        return Ok(LegClose::filled(Some(order.price), FeeType::Maker));
    }

    warn!(leg = %leg.role, exchange = %leg.exchange, order_id = %order.order_id, "Close order not filled in time, forcing close");
    let closed = leg.cancel_and_safe_close(Some(&order.order_id)).await?;
    Ok(LegClose::filled(
        closed.exit_price.or(Some(order.price)),
        FeeType::Taker,
    ))
}

#[async_trait]
impl CloseStrategy for UltraFastStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn avg_close_time_ms(&self) -> u64 {
        300
    }

    fn is_supported(&self) -> bool {
        [&self.primary, &self.hedge]
            .iter()
            .all(|c| get_capabilities(&c.exchange_name()).push_order_updates)
    }

    async fn close_positions(&self, options: &CloseOptions) -> CloseResult {
        let started = Instant::now();
        let (mut primary, mut hedge) = LegContext::pair(&self.primary, &self.hedge, options);
        info!(
            primary = %primary.label(),
            hedge = %hedge.label(),
            quantity = %options.quantity,
            "Ultra-fast close started"
        );

        match self.run(&mut primary, &mut hedge, options).await {
            Ok((primary_close, hedge_close)) => {
                let result =
                    CloseResult::closed(NAME, primary_close, hedge_close, started.elapsed());
                info!(elapsed_ms = result.elapsed_ms, primary_fee = ?result.primary_fee_type, hedge_fee = ?result.hedge_fee_type, "Ultra-fast close finished");
                result
            }
            Err(e) => {
                error!(error = %e, "Ultra-fast close failed, falling back to emergency close");
                emergency_close_pair(NAME, &primary, &hedge, &e.to_string(), started).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{
        ConnectorCall, LimitFillMode, MockExchange, MockExchangeConnector, OrderResponse,
        OrderSide, OrderUpdate, PositionSide, PositionSnapshot, SymbolLimits,
    };
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn limits() -> SymbolLimits {
        SymbolLimits {
            min_order_qty: dec!(0.001),
            min_notional: dec!(5),
            qty_step: dec!(0.001),
            price_step: dec!(0.1),
        }
    }

    fn venue(name: &str, fill: LimitFillMode, position: Decimal) -> Arc<MockExchange> {
        let exchange = MockExchange::new(name).with_push().with_limit_fill(fill);
        exchange.add_market("BTCUSDT", "BTC", "USDT", dec!(50000), limits());
        exchange.set_position("BTCUSDT", position);
        Arc::new(exchange)
    }

    fn config() -> CloseConfig {
        CloseConfig {
            ultra_fast_max_wait_ms: 150,
            price_wait_ms: 50,
            ..CloseConfig::default()
        }
    }

    fn strategy(
        primary: Arc<dyn ExchangeConnector>,
        hedge: Arc<dyn ExchangeConnector>,
        seed_prices: bool,
    ) -> UltraFastStrategy {
        let cache = Arc::new(PriceCache::new());
        if seed_prices {
            cache.update(&primary.exchange_name(), "BTCUSDT", dec!(50000));
            cache.update(&hedge.exchange_name(), "BTCUSDT", dec!(50000));
        }
        UltraFastStrategy::new(primary, hedge, config(), cache)
    }

    fn options() -> CloseOptions {
        CloseOptions::new("BTCUSDT", "BTCUSDT", PositionSide::Long, dec!(1))
    }

    #[tokio::test]
    async fn test_both_legs_fill_as_maker() {
        let primary = venue("binance", LimitFillMode::Fill, dec!(1));
        let hedge = venue("bybit", LimitFillMode::Fill, dec!(-1));

        let result = strategy(primary.clone(), hedge.clone(), true)
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert!(result.primary_closed && result.hedge_closed);
        assert_eq!(result.primary_fee_type, Some(FeeType::Maker));
        assert_eq!(result.hedge_fee_type, Some(FeeType::Maker));
        assert_eq!(result.primary_exit_price, Some(dec!(49975)));
        assert_eq!(result.hedge_exit_price, Some(dec!(50025)));
        assert_eq!(primary.position("BTCUSDT"), Decimal::ZERO);
        assert_eq!(hedge.position("BTCUSDT"), Decimal::ZERO);

        assert!(primary.calls().contains(&ConnectorCall::LimitOrder {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(1),
            price: dec!(49975),
            options: LimitOrderOptions {
                reduce_only: true,
                post_only: true,
            },
            via_push: true,
        }));
        assert_eq!(primary.market_order_count() + hedge.market_order_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_force_closes_as_taker() {
        let primary = venue("binance", LimitFillMode::Rest, dec!(1));
        let hedge = venue("bybit", LimitFillMode::Rest, dec!(-1));

        let result = strategy(primary.clone(), hedge.clone(), true)
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert_eq!(result.primary_fee_type, Some(FeeType::Taker));
        assert_eq!(result.hedge_fee_type, Some(FeeType::Taker));
        for exchange in [&primary, &hedge] {
            let calls = exchange.calls();
            assert!(calls.iter().any(|c| matches!(c, ConnectorCall::CancelOrder { .. })));
            assert!(calls.iter().any(|c| matches!(c, ConnectorCall::ReduceOnlyOrder { .. })));
            assert_eq!(exchange.open_order_count(), 0);
            assert_eq!(exchange.position("BTCUSDT"), Decimal::ZERO);
            assert_eq!(exchange.market_order_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_already_flat_places_nothing() {
        let primary = venue("binance", LimitFillMode::Fill, Decimal::ZERO);
        let hedge = venue("bybit", LimitFillMode::Fill, Decimal::ZERO);

        let result = strategy(primary.clone(), hedge.clone(), false)
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert!(result.primary_closed && result.hedge_closed);
        assert_eq!(result.primary_fee_type, None);
        assert_eq!(primary.order_placement_count() + hedge.order_placement_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_price_falls_back_to_emergency_close() {
        let primary = venue("binance", LimitFillMode::Fill, dec!(1));
        let hedge = venue("bybit", LimitFillMode::Fill, dec!(-1));

        let result = strategy(primary.clone(), hedge.clone(), false)
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert_eq!(result.primary_fee_type, Some(FeeType::Taker));
        assert_eq!(result.hedge_fee_type, Some(FeeType::Taker));
        assert!(!primary
            .calls()
            .iter()
            .any(|c| matches!(c, ConnectorCall::LimitOrder { .. })));
        assert_eq!(primary.position("BTCUSDT"), Decimal::ZERO);
        assert_eq!(hedge.position("BTCUSDT"), Decimal::ZERO);
        assert_eq!(primary.market_order_count() + hedge.market_order_count(), 0);
    }

    #[tokio::test]
    async fn test_placement_failure_cancels_other_leg() {
        let primary = venue("binance", LimitFillMode::Rest, dec!(1));

        let mut hedge = MockExchangeConnector::new();
        hedge.expect_exchange_name().returning(|| "bybit".to_string());
        hedge.expect_get_position().returning(|symbol| {
            Ok(PositionSnapshot {
                symbol: symbol.to_string(),
                size: dec!(-1),
                mark_price: None,
            })
        });
        hedge.expect_subscribe().returning(|| None);
        hedge.expect_get_symbol_limits().returning(|_| Ok(limits()));
        hedge
            .expect_place_limit_order_push()
            .returning(|_, _, _, _, _| Err(anyhow::anyhow!("System busy")));
        hedge
            .expect_place_limit_order()
            .returning(|_, _, _, _, _| Err(anyhow::anyhow!("System busy")));
        hedge.expect_place_reduce_only_order().times(1).returning(|symbol, _, qty| {
            Ok(OrderResponse::cumulative("h-1", symbol, qty, dec!(50010), dec!(0.05)))
        });
        hedge.expect_place_market_order().never();

        let result = strategy(primary.clone(), Arc::new(hedge), true)
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert_eq!(result.hedge_exit_price, Some(dec!(50010)));
        assert_eq!(result.primary_fee_type, Some(FeeType::Taker));
        assert!(primary
            .calls()
            .iter()
            .any(|c| matches!(c, ConnectorCall::CancelOrder { .. })));
        assert_eq!(primary.open_order_count(), 0);
        assert_eq!(primary.position("BTCUSDT"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_rest_fallback_order_is_watched_and_filled_as_maker() {
        let primary = venue("binance", LimitFillMode::Fill, dec!(1));
        let (tx, _) = broadcast::channel::<PushEvent>(16);

        let mut hedge = MockExchangeConnector::new();
        hedge.expect_exchange_name().returning(|| "bybit".to_string());
        hedge.expect_get_position().returning(|symbol| {
            Ok(PositionSnapshot {
                symbol: symbol.to_string(),
                size: dec!(-1),
                mark_price: None,
            })
        });
        let subscriptions = tx.clone();
        hedge
            .expect_subscribe()
            .returning(move || Some(subscriptions.subscribe()));
        hedge.expect_get_symbol_limits().returning(|_| Ok(limits()));
        hedge
            .expect_place_limit_order_push()
            .times(1)
            .returning(|_, _, _, _, _| Err(anyhow::anyhow!("websocket session closed")));
        let fills = tx.clone();
        hedge
            .expect_place_limit_order()
            .withf(|symbol, side, quantity, price, options| {
                symbol == "BTCUSDT"
                    && *side == OrderSide::Buy
                    && *quantity == dec!(1)
                    && *price == dec!(50025)
                    && options.reduce_only
                    && options.post_only
            })
            .times(1)
            .returning(move |symbol, _, _, price, _| {
                // Rests on placement, fills shortly after over the push channel
                let _ = fills.send(PushEvent::Order(OrderUpdate {
                    order_id: "h-rest-1".to_string(),
                    symbol: symbol.to_string(),
                    status: OrderStatus::Filled,
                    filled_qty: dec!(1),
                    avg_price: Some(price),
                }));
                Ok(OrderResponse::accepted("h-rest-1", symbol, price))
            });
        hedge.expect_cancel_order().never();
        hedge.expect_place_reduce_only_order().never();
        hedge.expect_close_position().never();
        hedge.expect_place_market_order().never();

        let result = strategy(primary.clone(), Arc::new(hedge), true)
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert!(result.primary_closed && result.hedge_closed);
        assert_eq!(result.hedge_fee_type, Some(FeeType::Maker));
        assert_eq!(result.hedge_exit_price, Some(dec!(50025)));
        assert_eq!(result.primary_fee_type, Some(FeeType::Maker));
        assert_eq!(primary.market_order_count(), 0);
    }

    #[tokio::test]
    async fn test_max_wait_override_is_honored() {
        let primary = venue("binance", LimitFillMode::Rest, dec!(1));
        let hedge = venue("bybit", LimitFillMode::Rest, dec!(-1));

        let options = options().with_max_wait(Duration::from_millis(10));
        let result = strategy(primary, hedge, true).close_positions(&options).await;

        assert!(result.success);
        assert!(result.elapsed_ms < 150);
    }
}
