//! Shared test fixtures for triangle and persistence tests.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::types::*;
use crate::exchange::OrderSide;

pub fn sample_opportunity(id: &str) -> TriangleOpportunity {
    TriangleOpportunity {
        id: id.to_string(),
        exchange: "bybit".to_string(),
        symbols: ["ETHUSDT".to_string(), "ETHBTC".to_string(), "BTCUSDT".to_string()],
        base_asset: "ETH".to_string(),
        quote_asset: "USDT".to_string(),
        bridge_asset: "BTC".to_string(),
        expected_profit_pct: dec!(0.2),
        consumed: false,
        discovered_at: Utc::now(),
    }
}

fn planned_leg(
    leg: u8,
    symbol: &str,
    side: OrderSide,
    assets: (&str, &str),
    input_amount: Decimal,
    output_amount: Decimal,
    price: Decimal,
) -> TradeLeg {
    TradeLeg {
        leg,
        symbol: symbol.to_string(),
        side,
        input_asset: assets.0.to_string(),
        output_asset: assets.1.to_string(),
        input_amount,
        output_amount,
        fee: Decimal::ZERO,
        price,
    }
}

/// Forward plan at ETHUSDT=10, ETHBTC=0.5, BTCUSDT=20 with no fees.
pub fn sample_plan(size: Decimal) -> TrianglePlan {
    TrianglePlan {
        direction: TriangleDirection::Forward,
        legs: [
            planned_leg(1, "ETHUSDT", OrderSide::Buy, ("USDT", "ETH"), size, size / dec!(10), dec!(10)),
            planned_leg(2, "ETHBTC", OrderSide::Sell, ("ETH", "BTC"), size / dec!(10), size / dec!(20), dec!(0.5)),
            planned_leg(3, "BTCUSDT", OrderSide::Sell, ("BTC", "USDT"), size / dec!(20), size, dec!(20)),
        ],
        entry_qty: size,
        expected_return_qty: size,
        expected_profit_pct: Decimal::ZERO,
        expected_profit_amount: Decimal::ZERO,
    }
}

pub fn sample_request(user_id: &str, size: Decimal) -> ExecutionRequest {
    ExecutionRequest {
        user_id: user_id.to_string(),
        position_size: size,
        max_slippage_pct: dec!(0.5),
        execution_timeout_secs: Some(5),
        credential_ref: None,
    }
}

/// A fresh position in `VALIDATING`.
pub fn sample_position(id: &str, user_id: &str) -> TriangularPosition {
    TriangularPosition::new(
        id.to_string(),
        &sample_opportunity("opp-1"),
        &sample_plan(dec!(100)),
        &sample_request(user_id, dec!(100)),
        30,
    )
}

pub fn sample_execution(leg: u8, avg_price: Decimal, output_amount: Decimal) -> LegExecution {
    let (symbol, side) = match leg {
        1 => ("ETHUSDT", OrderSide::Buy),
        2 => ("ETHBTC", OrderSide::Sell),
        _ => ("BTCUSDT", OrderSide::Sell),
    };
    LegExecution {
        leg,
        symbol: symbol.to_string(),
        side,
        planned_qty: dec!(1),
        planned_price: avg_price,
        order_id: format!("order-{}", leg),
        filled_qty: dec!(1),
        output_amount,
        avg_price,
        fees: dec!(0.01),
        executed_at: Utc::now(),
    }
}
