//! Safe close: the only way a close path is allowed to take liquidity.
//!
//! A safe close re-reads the live position and then tries, in order, a
//! reduce-only order and the exchange's close-position call. Neither can
//! open or grow a position, so a stale size or a race with another closer
//! can never leave the account with fresh exposure. Unrestricted market
//! orders are never used here.

use rust_decimal::Decimal;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::types::{CloseResult, FeeType, LegClose};
use crate::error::CloseError;
use crate::exchange::{get_capabilities, ExchangeConnector, OrderSide, PositionSide};
use crate::utils::round_to_step;

/// Error fragments meaning the position is already gone.
const ALREADY_CLOSED_MARKERS: &[&str] = &[
    "position is zero",
    "position not found",
    "no position",
    "reduce only order is rejected",
    "reduceonly order is rejected",
    "reduce-only order is rejected",
    "position does not exist",
    "position not exist",
];

/// Whether an exchange error means there was nothing left to close.
pub fn is_already_closed_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ALREADY_CLOSED_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Limit price that crosses the book by `margin`: sells below the market,
/// buys above it. Rounded to `price_step` when one is known.
pub fn aggressive_limit_price(
    side: OrderSide,
    market_price: Decimal,
    margin: Decimal,
    price_step: Decimal,
) -> Decimal {
    let raw = match side {
        OrderSide::Sell => market_price * (Decimal::ONE - margin),
        OrderSide::Buy => market_price * (Decimal::ONE + margin),
    };
    round_to_step(raw, price_step)
}

/// Close one position without ever opening exposure.
///
/// `side` and `quantity` are the caller's belief about the position; the
/// live position takes precedence whenever it can be read. Returns
/// [`LegClose::already_flat`] when no order was needed.
pub async fn safe_close(
    connector: &dyn ExchangeConnector,
    symbol: &str,
    side: PositionSide,
    quantity: Decimal,
) -> Result<LegClose, CloseError> {
    let exchange = connector.exchange_name();

    let (side, quantity) = match connector.get_position(symbol).await {
        Ok(position) => match PositionSide::from_signed_size(position.size) {
            None => {
                debug!(%exchange, %symbol, "Position already flat, nothing to close");
                return Ok(LegClose::already_flat());
            }
            Some(actual_side) => {
                if actual_side != side {
                    warn!(%exchange, %symbol, expected = %side, actual = %actual_side, "Position side differs from request, closing actual side");
                }
                (actual_side, position.size.abs())
            }
        },
        Err(e) => {
            warn!(%exchange, %symbol, error = %e, "Could not read position, closing requested size");
            (side, quantity)
        }
    };

    let closing_side = side.closing_side();
    let capabilities = get_capabilities(&exchange);

    let reduce_only_error = if capabilities.reduce_only {
        match connector
            .place_reduce_only_order(symbol, closing_side, quantity)
            .await
        {
            Ok(response) => {
                let fill = response.normalize();
                info!(%exchange, %symbol, %quantity, avg_price = %fill.avg_price, "Closed with reduce-only order");
                return Ok(LegClose::filled(positive(fill.avg_price), FeeType::Taker));
            }
            Err(e) if is_already_closed_error(&e.to_string()) => {
                info!(%exchange, %symbol, "Reduce-only rejected, position already closed");
                return Ok(LegClose::already_flat());
            }
            Err(e) => {
                warn!(%exchange, %symbol, error = %e, "Reduce-only close failed, trying close-position");
                e.to_string()
            }
        }
    } else {
        "reduce-only not supported".to_string()
    };

    match connector.close_position(symbol).await {
        Ok(response) => {
            let fill = response.normalize();
            info!(%exchange, %symbol, avg_price = %fill.avg_price, "Closed with close-position");
            Ok(LegClose::filled(positive(fill.avg_price), FeeType::Taker))
        }
        Err(e) if is_already_closed_error(&e.to_string()) => {
            info!(%exchange, %symbol, "Close-position found no position");
            Ok(LegClose::already_flat())
        }
        Err(e) => {
            error!(%exchange, %symbol, %reduce_only_error, close_error = %e, "Safe close failed, manual intervention required");
            Err(CloseError::ManualInterventionRequired {
                exchange,
                symbol: symbol.to_string(),
                reduce_only_error,
                close_error: e.to_string(),
            })
        }
    }
}

fn positive(price: Decimal) -> Option<Decimal> {
    (price > Decimal::ZERO).then_some(price)
}

/// Safe-close both legs concurrently after a strategy error.
///
/// Success yields a normal closed result with taker fees. If either leg
/// cannot be closed the result reports failure, both flags false, and
/// names the legs still open.
pub async fn emergency_close(
    strategy: &str,
    primary: (&dyn ExchangeConnector, &str, PositionSide, Decimal),
    hedge: (&dyn ExchangeConnector, &str, PositionSide, Decimal),
    cause: &str,
    started: Instant,
) -> CloseResult {
    warn!(strategy, %cause, "Emergency close of both legs");

    let (primary_result, hedge_result) = tokio::join!(
        safe_close(primary.0, primary.1, primary.2, primary.3),
        safe_close(hedge.0, hedge.1, hedge.2, hedge.3),
    );

    match (primary_result, hedge_result) {
        (Ok(p), Ok(h)) => CloseResult::closed(strategy, taker(p), taker(h), started.elapsed()),
        (primary_result, hedge_result) => {
            let mut remaining_open = Vec::new();
            let mut errors = Vec::new();
            for (connector, symbol, result) in [
                (primary.0, primary.1, primary_result),
                (hedge.0, hedge.1, hedge_result),
            ] {
                if let Err(e) = result {
                    remaining_open.push(format!("{}:{}", connector.exchange_name(), symbol));
                    errors.push(e.to_string());
                }
            }
            let error = format!(
                "Emergency close failed after: {}. {}. Still open: {}",
                cause,
                errors.join("; "),
                remaining_open.join(", ")
            );
            error!(strategy, %error, "Emergency close failed");
            CloseResult::failed(strategy, error, remaining_open, started.elapsed())
        }
    }
}

/// Emergency exits always take liquidity.
fn taker(leg: LegClose) -> LegClose {
    LegClose {
        fee_type: Some(FeeType::Taker),
        ..leg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ConnectorCall, MockExchange, MockExchangeConnector};
    use rust_decimal_macros::dec;

    fn exchange(name: &str) -> MockExchange {
        let exchange = MockExchange::new(name);
        exchange.add_market("BTCUSDT", "BTC", "USDT", dec!(50000), Default::default());
        exchange
    }

    #[test]
    fn test_already_closed_errors_recognized() {
        assert!(is_already_closed_error("Position is zero, cannot fix reduce-only order qty"));
        assert!(is_already_closed_error("position not found"));
        assert!(is_already_closed_error("No position to close"));
        assert!(is_already_closed_error("ReduceOnly Order is rejected"));
        assert!(!is_already_closed_error("Insufficient margin"));
        assert!(!is_already_closed_error("rate limit exceeded"));
    }

    #[test]
    fn test_aggressive_prices_cross_the_book() {
        assert_eq!(
            aggressive_limit_price(OrderSide::Sell, dec!(50000), dec!(0.0005), dec!(0.1)),
            dec!(49975)
        );
        assert_eq!(
            aggressive_limit_price(OrderSide::Buy, dec!(50000), dec!(0.0005), dec!(0.1)),
            dec!(50025)
        );
        assert_eq!(
            aggressive_limit_price(OrderSide::Buy, dec!(3.3333), dec!(0.001), dec!(0.01)),
            dec!(3.34)
        );
    }

    #[tokio::test]
    async fn test_flat_position_places_no_order() {
        let exchange = exchange("bybit");

        let leg = safe_close(&exchange, "BTCUSDT", PositionSide::Long, dec!(1))
            .await
            .unwrap();

        assert_eq!(leg, LegClose::already_flat());
        assert_eq!(exchange.order_placement_count(), 0);
    }

    #[tokio::test]
    async fn test_uses_live_size_and_reduce_only() {
        let exchange = exchange("bybit");
        exchange.set_position("BTCUSDT", dec!(-0.3));

        // Caller believes 1 BTC long; the exchange says 0.3 short
        let leg = safe_close(&exchange, "BTCUSDT", PositionSide::Long, dec!(1))
            .await
            .unwrap();

        assert!(leg.closed);
        assert_eq!(leg.fee_type, Some(FeeType::Taker));
        assert_eq!(exchange.position("BTCUSDT"), Decimal::ZERO);
        assert!(exchange.calls().contains(&ConnectorCall::ReduceOnlyOrder {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(0.3),
        }));
        assert_eq!(exchange.market_order_count(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_close_position() {
        let exchange = exchange("bybit");
        exchange.set_position("BTCUSDT", dec!(1));
        exchange.fail_reduce_only("Insufficient margin");

        let leg = safe_close(&exchange, "BTCUSDT", PositionSide::Long, dec!(1))
            .await
            .unwrap();

        assert_eq!(leg.exit_price, Some(dec!(50000)));
        assert!(exchange.calls().contains(&ConnectorCall::ClosePosition {
            symbol: "BTCUSDT".to_string()
        }));
        assert_eq!(exchange.market_order_count(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_position_uses_requested_size() {
        let exchange = exchange("bybit");
        exchange.set_position("BTCUSDT", dec!(2));
        exchange.fail_get_position("timeout");

        safe_close(&exchange, "BTCUSDT", PositionSide::Long, dec!(0.5))
            .await
            .unwrap();

        assert_eq!(exchange.position("BTCUSDT"), dec!(1.5));
    }

    #[tokio::test]
    async fn test_both_methods_failing_requires_manual_close() {
        let exchange = exchange("bybit");
        exchange.set_position("BTCUSDT", dec!(1));
        exchange.fail_reduce_only("Insufficient margin");
        exchange.fail_close_position("System busy");

        let err = safe_close(&exchange, "BTCUSDT", PositionSide::Long, dec!(1))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("MANUAL INTERVENTION REQUIRED"));
        assert_eq!(exchange.market_order_count(), 0);
    }

    #[tokio::test]
    async fn test_race_with_external_close_counts_as_success() {
        let mut connector = MockExchangeConnector::new();
        connector
            .expect_exchange_name()
            .returning(|| "bybit".to_string());
        connector.expect_get_position().returning(|symbol| {
            Ok(crate::exchange::PositionSnapshot {
                symbol: symbol.to_string(),
                size: dec!(1),
                mark_price: None,
            })
        });
        connector
            .expect_place_reduce_only_order()
            .returning(|_, _, _| Err(anyhow::anyhow!("current position is zero, cannot fix reduce-only order qty")));
        connector.expect_place_market_order().never();
        connector.expect_close_position().never();

        let leg = safe_close(&connector, "BTCUSDT", PositionSide::Long, dec!(1))
            .await
            .unwrap();
        assert!(leg.closed);
        assert_eq!(leg.fee_type, None);
    }

    #[tokio::test]
    async fn test_emergency_failure_reports_open_legs() {
        let primary = exchange("binance");
        primary.set_position("BTCUSDT", dec!(1));
        let hedge = exchange("bybit");
        hedge.set_position("BTCUSDT", dec!(-1));
        hedge.fail_reduce_only("Insufficient margin");
        hedge.fail_close_position("System busy");

        let result = emergency_close(
            "ultra_fast",
            (&primary, "BTCUSDT", PositionSide::Long, dec!(1)),
            (&hedge, "BTCUSDT", PositionSide::Short, dec!(1)),
            "order placement failed",
            Instant::now(),
        )
        .await;

        assert!(!result.success);
        assert!(!result.primary_closed);
        assert!(!result.hedge_closed);
        assert_eq!(result.remaining_open, vec!["bybit:BTCUSDT".to_string()]);
        let error = result.error.unwrap();
        assert!(error.contains("order placement failed"));
        assert!(error.contains("MANUAL INTERVENTION REQUIRED"));
        // The primary still got closed
        assert_eq!(primary.position("BTCUSDT"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_emergency_success_is_taker() {
        let primary = exchange("binance");
        primary.set_position("BTCUSDT", dec!(1));
        let hedge = exchange("bybit");

        let result = emergency_close(
            "hybrid",
            (&primary, "BTCUSDT", PositionSide::Long, dec!(1)),
            (&hedge, "BTCUSDT", PositionSide::Short, dec!(1)),
            "price fetch failed",
            Instant::now(),
        )
        .await;

        assert!(result.success);
        assert_eq!(result.primary_fee_type, Some(FeeType::Taker));
        assert_eq!(result.hedge_fee_type, Some(FeeType::Taker));
    }
}
