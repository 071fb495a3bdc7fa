//! Hybrid close for exchanges without push order updates.
//!
//! Places reduce-only limit orders priced from a REST quote, then polls
//! until both positions are flat, preferring pushed position updates where
//! an exchange streams them. Legs still open at the max wait are cancelled
//! and safe-closed independently.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use super::safe_close::{aggressive_limit_price, is_already_closed_error, safe_close};
use super::strategy::{emergency_close_pair, CloseStrategy, LegContext};
use super::types::{CloseOptions, CloseResult, FeeType, LegClose};
use crate::config::CloseConfig;
use crate::error::CloseError;
use crate::exchange::{ExchangeConnector, LimitOrderOptions, PushEvent};

const NAME: &str = "hybrid";

pub struct HybridStrategy {
    primary: Arc<dyn ExchangeConnector>,
    hedge: Arc<dyn ExchangeConnector>,
    config: CloseConfig,
}

/// Close progress of one leg.
#[derive(Default)]
struct LegState {
    closed: bool,
    /// Resting limit order to cancel on timeout
    order_id: Option<String>,
    exit_price: Option<Decimal>,
    fee_type: Option<FeeType>,
    position_rx: Option<broadcast::Receiver<PushEvent>>,
    pushed_size: Option<(Decimal, Instant)>,
}

impl LegState {
    fn flat() -> Self {
        Self {
            closed: true,
            ..Default::default()
        }
    }

    fn into_leg_close(self) -> LegClose {
        LegClose {
            closed: true,
            exit_price: self.exit_price,
            fee_type: self.fee_type,
        }
    }

    /// Drain pending push updates, keeping the latest size for `symbol`.
    fn drain_push(&mut self, symbol: &str) {
        let Some(rx) = self.position_rx.as_mut() else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(PushEvent::Position(update)) if update.symbol == symbol => {
                    self.pushed_size = Some((update.size, Instant::now()));
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(%symbol, skipped, "Position stream lagged");
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    self.position_rx = None;
                    break;
                }
            }
        }
    }
}

impl HybridStrategy {
    pub fn new(
        primary: Arc<dyn ExchangeConnector>,
        hedge: Arc<dyn ExchangeConnector>,
        config: CloseConfig,
    ) -> Self {
        Self {
            primary,
            hedge,
            config,
        }
    }

    async fn market_price(&self, leg: &LegContext, open: bool) -> Result<Option<Decimal>, CloseError> {
        if !open {
            return Ok(None);
        }
        let price = leg
            .connector
            .get_market_price(&leg.symbol)
            .await
            .map_err(|e| CloseError::Other(e.context(format!("{} price fetch failed", leg.label()))))?;
        Ok(Some(price))
    }

    /// Start closing a leg, recording what was placed in `state`.
    async fn place(
        &self,
        leg: &LegContext,
        market_price: Option<Decimal>,
        margin: Decimal,
        state: &mut LegState,
    ) -> Result<(), CloseError> {
        let Some(market_price) = market_price else {
            return Ok(());
        };
        let side = leg.side.closing_side();

        if !leg.capabilities.reduce_only {
            info!(leg = %leg.role, exchange = %leg.exchange, "No reduce-only support, closing directly");
            let closed = safe_close(leg.connector.as_ref(), &leg.symbol, leg.side, leg.quantity).await?;
            state.closed = true;
            state.exit_price = closed.exit_price;
            state.fee_type = closed.fee_type;
            return Ok(());
        }

        let placed = if leg.capabilities.limit_orders {
            let limits = leg.limits().await;
            let price = aggressive_limit_price(side, market_price, margin, limits.price_step);
            let options = LimitOrderOptions {
                reduce_only: true,
                post_only: false,
            };
            leg.connector
                .place_limit_order(&leg.symbol, side, leg.quantity, price, options)
                .await
                .map(|response| {
                    state.order_id = Some(response.order_id);
                    state.exit_price = Some(price);
                    state.fee_type = Some(FeeType::Maker);
                })
        } else {
            leg.connector
                .place_reduce_only_order(&leg.symbol, side, leg.quantity)
                .await
                .map(|response| {
                    let fill = response.normalize();
                    state.exit_price = (fill.avg_price > Decimal::ZERO).then_some(fill.avg_price);
                    state.fee_type = Some(FeeType::Taker);
                })
        };

        match placed {
            Ok(()) => {
                info!(leg = %leg.role, exchange = %leg.exchange, %side, quantity = %leg.quantity, price = ?state.exit_price, "Close order placed");
                Ok(())
            }
            Err(e) if is_already_closed_error(&e.to_string()) => {
                info!(leg = %leg.role, exchange = %leg.exchange, "Order rejected, position already closed");
                *state = LegState::flat();
                Ok(())
            }
            Err(e) => Err(CloseError::Other(
                e.context(format!("{} close order failed", leg.label())),
            )),
        }
    }

    /// Update `state.closed`, preferring a fresh pushed size over a REST read.
    async fn check_closed(&self, leg: &LegContext, state: &mut LegState) {
        if state.closed {
            return;
        }

        state.drain_push(&leg.symbol);
        let fresh_push = state
            .pushed_size
            .filter(|(_, at)| at.elapsed() < self.config.push_fresh())
            .map(|(size, _)| size);

        let size = match fresh_push {
            Some(size) => size,
            None => match leg.connector.get_position(&leg.symbol).await {
                Ok(position) => position.size,
                Err(e) => {
                    warn!(leg = %leg.role, exchange = %leg.exchange, error = %e, "Position poll failed");
                    return;
                }
            },
        };

        if size.is_zero() {
            info!(leg = %leg.role, exchange = %leg.exchange, pushed = fresh_push.is_some(), "Leg closed");
            state.closed = true;
        }
    }

    /// Cancel and safe-close a leg still open at the max wait.
    async fn force_close(&self, leg: &LegContext, state: LegState) -> Result<LegClose, CloseError> {
        if state.closed {
            return Ok(state.into_leg_close());
        }
        warn!(leg = %leg.role, exchange = %leg.exchange, "Leg still open at max wait, forcing close");
        let closed = leg.cancel_and_safe_close(state.order_id.as_deref()).await?;
        Ok(LegClose::filled(
            closed.exit_price.or(state.exit_price),
            FeeType::Taker,
        ))
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

        let mut primary_state = LegState::default();
        let mut hedge_state = LegState::default();
        for (leg, open, state) in [
            (&*primary, primary_open, &mut primary_state),
            (&*hedge, hedge_open, &mut hedge_state),
        ] {
            if !open {
                *state = LegState::flat();
            } else if leg.capabilities.push_position_updates {
                state.position_rx = leg.connector.subscribe();
            }
        }

        let (primary_price, hedge_price) = tokio::try_join!(
            self.market_price(primary, primary_open),
            self.market_price(hedge, hedge_open),
        )?;

        let margin = options
            .aggressive_margin
            .unwrap_or(self.config.aggressive_margin);
        let (primary_placed, hedge_placed) = tokio::join!(
            self.place(primary, primary_price, margin, &mut primary_state),
            self.place(hedge, hedge_price, margin, &mut hedge_state),
        );
        if let Err(e) = primary_placed.and(hedge_placed) {
            // Neither leg's order may be left resting
            for (leg, state) in [(&*primary, &primary_state), (&*hedge, &hedge_state)] {
                if let Some(order_id) = &state.order_id {
                    leg.cancel_quietly(order_id).await;
                }
            }
            return Err(e);
        }

        let any_push = primary_state.position_rx.is_some() || hedge_state.position_rx.is_some();
        let interval = self.config.poll_interval(any_push);
        let deadline = tokio::time::Instant::now()
            + options.max_wait.unwrap_or(self.config.hybrid_max_wait());
        debug!(?interval, any_push, "Polling for closed positions");

        loop {
            tokio::join!(
                self.check_closed(primary, &mut primary_state),
                self.check_closed(hedge, &mut hedge_state),
            );
            if primary_state.closed && hedge_state.closed {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep_until((now + interval).min(deadline)).await;
        }

        let (primary_close, hedge_close) = tokio::join!(
            self.force_close(primary, primary_state),
            self.force_close(hedge, hedge_state),
        );
        Ok((primary_close?, hedge_close?))
    }
}

#[async_trait]
impl CloseStrategy for HybridStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn avg_close_time_ms(&self) -> u64 {
        2000
    }

    /// Hybrid needs nothing beyond REST, so it runs anywhere.
    fn is_supported(&self) -> bool {
        true
    }

    async fn close_positions(&self, options: &CloseOptions) -> CloseResult {
        let started = Instant::now();
        let (mut primary, mut hedge) = LegContext::pair(&self.primary, &self.hedge, options);
        info!(
            primary = %primary.label(),
            hedge = %hedge.label(),
            quantity = %options.quantity,
            "Hybrid close started"
        );

        match self.run(&mut primary, &mut hedge, options).await {
            Ok((primary_close, hedge_close)) => {
                let result =
                    CloseResult::closed(NAME, primary_close, hedge_close, started.elapsed());
                info!(elapsed_ms = result.elapsed_ms, primary_fee = ?result.primary_fee_type, hedge_fee = ?result.hedge_fee_type, "Hybrid close finished");
                result
            }
            Err(e) => {
                error!(error = %e, "Hybrid close failed, falling back to emergency close");
                emergency_close_pair(NAME, &primary, &hedge, &e.to_string(), started).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ConnectorCall, LimitFillMode, MockExchange, PositionSide, SymbolLimits};
    use rust_decimal_macros::dec;

    fn venue(name: &str, fill: LimitFillMode, position: Decimal, push: bool) -> Arc<MockExchange> {
        let mut exchange = MockExchange::new(name).with_limit_fill(fill);
        if push {
            exchange = exchange.with_push();
        }
        let limits = SymbolLimits {
            price_step: dec!(0.1),
            ..Default::default()
        };
        exchange.add_market("BTCUSDT", "BTC", "USDT", dec!(50000), limits);
        exchange.set_position("BTCUSDT", position);
        Arc::new(exchange)
    }

    fn strategy(primary: Arc<MockExchange>, hedge: Arc<MockExchange>) -> HybridStrategy {
        let config = CloseConfig {
            hybrid_max_wait_ms: 200,
            push_poll_interval_ms: 20,
            rest_poll_interval_ms: 40,
            ..CloseConfig::default()
        };
        HybridStrategy::new(primary, hedge, config)
    }

    fn options() -> CloseOptions {
        CloseOptions::new("BTCUSDT", "BTCUSDT", PositionSide::Short, dec!(1))
    }

    fn position_polls(exchange: &MockExchange) -> usize {
        exchange
            .calls()
            .iter()
            .filter(|c| matches!(c, ConnectorCall::GetPosition { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_limit_fills_detected_via_push_positions() {
        // bitget streams positions but not orders
        let primary = venue("bitget", LimitFillMode::Fill, dec!(-1), true);
        let hedge = venue("gate", LimitFillMode::Fill, dec!(1), true);

        let result = strategy(primary.clone(), hedge.clone())
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert_eq!(result.strategy, "hybrid");
        assert_eq!(result.primary_fee_type, Some(FeeType::Maker));
        assert_eq!(result.hedge_fee_type, Some(FeeType::Maker));
        assert_eq!(result.primary_exit_price, Some(dec!(50025)));
        assert_eq!(result.hedge_exit_price, Some(dec!(49975)));
        // Only the pre-check hit REST; the close was seen on the push channel
        assert_eq!(position_polls(&primary), 1);
        assert_eq!(primary.market_order_count() + hedge.market_order_count(), 0);
        assert!(primary.calls().iter().any(|c| matches!(
            c,
            ConnectorCall::LimitOrder { options, via_push: false, .. } if options.reduce_only
        )));
    }

    #[tokio::test]
    async fn test_rest_only_legs_are_polled() {
        let primary = venue("bingx", LimitFillMode::Fill, dec!(-2), false);
        let hedge = venue("bingx", LimitFillMode::Fill, dec!(2), false);

        let result = strategy(primary.clone(), hedge.clone())
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert_eq!(result.primary_fee_type, Some(FeeType::Maker));
        assert_eq!(position_polls(&primary), 2);
        assert_eq!(primary.position("BTCUSDT"), Decimal::ZERO);
        assert_eq!(hedge.position("BTCUSDT"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_force_closes_both_as_taker() {
        let primary = venue("bitget", LimitFillMode::Rest, dec!(-1), true);
        let hedge = venue("bingx", LimitFillMode::Rest, dec!(1), false);

        let result = strategy(primary.clone(), hedge.clone())
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert_eq!(result.primary_fee_type, Some(FeeType::Taker));
        assert_eq!(result.hedge_fee_type, Some(FeeType::Taker));
        assert!(result.elapsed_ms >= 200);
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
    async fn test_exchange_without_reduce_only_uses_close_position() {
        let primary = venue("mexc", LimitFillMode::Fill, dec!(-1), false);
        let hedge = venue("bingx", LimitFillMode::Fill, dec!(1), false);

        let result = strategy(primary.clone(), hedge.clone())
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert_eq!(result.primary_fee_type, Some(FeeType::Taker));
        assert_eq!(result.hedge_fee_type, Some(FeeType::Maker));
        let calls = primary.calls();
        assert!(calls.contains(&ConnectorCall::ClosePosition {
            symbol: "BTCUSDT".to_string()
        }));
        assert!(!calls.iter().any(|c| matches!(
            c,
            ConnectorCall::LimitOrder { .. } | ConnectorCall::MarketOrder { .. }
        )));
    }

    #[tokio::test]
    async fn test_already_closed_race_places_nothing() {
        let primary = venue("bitget", LimitFillMode::Fill, Decimal::ZERO, true);
        let hedge = venue("bingx", LimitFillMode::Fill, Decimal::ZERO, false);

        let result = strategy(primary.clone(), hedge.clone())
            .close_positions(&options())
            .await;

        assert!(result.success);
        assert!(result.primary_closed && result.hedge_closed);
        assert_eq!(primary.order_placement_count() + hedge.order_placement_count(), 0);
    }

    #[tokio::test]
    async fn test_emergency_failure_reports_failure() {
        let primary = venue("bitget", LimitFillMode::Fill, dec!(-1), true);
        // Hedge position on a symbol the exchange cannot price or close
        let hedge = venue("bingx", LimitFillMode::Fill, Decimal::ZERO, false);
        hedge.set_position("ETHUSDT", dec!(1));

        let options = CloseOptions::new("BTCUSDT", "ETHUSDT", PositionSide::Short, dec!(1));
        let result = strategy(primary.clone(), hedge.clone())
            .close_positions(&options)
            .await;

        assert!(!result.success);
        assert!(!result.primary_closed);
        assert!(!result.hedge_closed);
        assert_eq!(result.remaining_open, vec!["bingx:ETHUSDT".to_string()]);
        assert!(result.error.unwrap().contains("MANUAL INTERVENTION REQUIRED"));
        // The closable leg was still flattened
        assert_eq!(primary.position("BTCUSDT"), Decimal::ZERO);
        assert_eq!(primary.market_order_count() + hedge.market_order_count(), 0);
    }
}
