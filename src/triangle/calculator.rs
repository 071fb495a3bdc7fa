//! Triangle plan calculation from live prices.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::types::{TradeLeg, TriangleDirection, TriangleOpportunity, TrianglePlan};
use crate::exchange::OrderSide;
use crate::utils::pct_change;

/// Recomputes a three-leg plan from current prices and a position size.
///
/// `prices` follow the opportunity's symbol order. Returns `None` when no
/// direction is profitable.
pub trait PlanCalculator: Send + Sync {
    fn calculate(
        &self,
        opportunity: &TriangleOpportunity,
        prices: [Decimal; 3],
        position_size: Decimal,
    ) -> Option<TrianglePlan>;
}

/// Evaluates both directions with an estimated taker fee per leg and picks
/// the more profitable one.
#[derive(Debug, Clone)]
pub struct TriangleCalculator {
    fee_rate: Decimal,
    min_profit_pct: Decimal,
}

impl TriangleCalculator {
    pub fn new(fee_rate: Decimal, min_profit_pct: Decimal) -> Self {
        Self {
            fee_rate,
            min_profit_pct,
        }
    }

    /// Convert `input` through one leg at `price`; returns (gross output, fee).
    fn convert(&self, side: OrderSide, input: Decimal, price: Decimal) -> (Decimal, Decimal) {
        let gross = match side {
            OrderSide::Buy => input / price,
            OrderSide::Sell => input * price,
        };
        let fee = gross * self.fee_rate;
        (gross, fee)
    }

    fn plan(
        &self,
        opportunity: &TriangleOpportunity,
        prices: [Decimal; 3],
        size: Decimal,
        direction: TriangleDirection,
    ) -> TrianglePlan {
        let o = opportunity;
        // (symbol index, side, input asset, output asset)
        let route = match direction {
            TriangleDirection::Forward => [
                (0, OrderSide::Buy, &o.quote_asset, &o.base_asset),
                (1, OrderSide::Sell, &o.base_asset, &o.bridge_asset),
                (2, OrderSide::Sell, &o.bridge_asset, &o.quote_asset),
            ],
            TriangleDirection::Reverse => [
                (2, OrderSide::Buy, &o.quote_asset, &o.bridge_asset),
                (1, OrderSide::Buy, &o.bridge_asset, &o.base_asset),
                (0, OrderSide::Sell, &o.base_asset, &o.quote_asset),
            ],
        };

        let mut amount = size;
        let mut leg_no = 0u8;
        let legs = route.map(|(idx, side, input_asset, output_asset)| {
            leg_no += 1;
            let price = prices[idx];
            let (gross, fee) = self.convert(side, amount, price);
            let input_amount = amount;
            amount = gross - fee;
            TradeLeg {
                leg: leg_no,
                symbol: o.symbols[idx].clone(),
                side,
                input_asset: input_asset.clone(),
                output_asset: output_asset.clone(),
                input_amount,
                output_amount: amount,
                fee,
                price,
            }
        });

        TrianglePlan {
            direction,
            legs,
            entry_qty: size,
            expected_return_qty: amount,
            expected_profit_pct: pct_change(size, amount),
            expected_profit_amount: amount - size,
        }
    }
}

impl Default for TriangleCalculator {
    fn default() -> Self {
        Self::new(dec!(0.001), Decimal::ZERO)
    }
}

impl PlanCalculator for TriangleCalculator {
    fn calculate(
        &self,
        opportunity: &TriangleOpportunity,
        prices: [Decimal; 3],
        position_size: Decimal,
    ) -> Option<TrianglePlan> {
        if position_size <= Decimal::ZERO || prices.iter().any(|p| *p <= Decimal::ZERO) {
            return None;
        }

        [TriangleDirection::Forward, TriangleDirection::Reverse]
            .into_iter()
            .map(|direction| self.plan(opportunity, prices, position_size, direction))
            .filter(|plan| plan.expected_profit_pct > self.min_profit_pct)
            .max_by(|a, b| a.expected_profit_pct.cmp(&b.expected_profit_pct))
    }
}
