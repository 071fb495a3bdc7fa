//! Pre-flight checks: order sizes against exchange minimums and leg-1 balance.

use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tracing::{debug, warn};

use super::limits_cache::SymbolLimitsCache;
use super::types::{TradeLeg, TrianglePlan};
use crate::config::TriangleConfig;
use crate::error::ExecutionError;
use crate::exchange::{ExchangeConnector, OrderSide};
use crate::utils::safe_div;

/// Validates a plan before any order is placed.
pub struct TradeValidator {
    limits: Arc<SymbolLimitsCache>,
    config: TriangleConfig,
}

impl TradeValidator {
    pub fn new(limits: Arc<SymbolLimitsCache>, config: TriangleConfig) -> Self {
        Self { limits, config }
    }

    /// Slippage buffer applied to leg `leg` (1-based): each prior leg
    /// compounds one buffer, so leg 1 is unbuffered.
    pub fn buffer_factor(&self, leg: u8) -> Decimal {
        let keep = Decimal::ONE - self.config.slippage_buffer_per_leg;
        (1..leg).fold(Decimal::ONE, |acc, _| acc * keep)
    }

    /// Base quantity a leg is expected to trade.
    fn expected_qty(leg: &TradeLeg) -> Decimal {
        match leg.side {
            OrderSide::Buy => safe_div(leg.input_amount, leg.price),
            OrderSide::Sell => leg.input_amount,
        }
    }

    /// Check every leg's expected size against the symbol's minimum quantity
    /// and minimum notional, both scaled by the safety multiplier.
    ///
    /// On failure the error names the first failing leg and suggests the
    /// smallest position size that would clear all legs.
    pub async fn validate_order_sizes(
        &self,
        connector: &dyn ExchangeConnector,
        plan: &TrianglePlan,
    ) -> Result<(), ExecutionError> {
        let multiplier = self.config.min_size_safety_multiplier;
        let mut first_failure: Option<(u8, String, String)> = None;
        let mut worst_ratio = Decimal::ONE;

        for leg in &plan.legs {
            let limits = self.limits.get_or_fetch(connector, &leg.symbol).await?;

            let qty = Self::expected_qty(leg) * self.buffer_factor(leg.leg);
            let notional = qty * leg.price;
            let required_qty = limits.min_order_qty * multiplier;
            let required_notional = limits.min_notional * multiplier;

            debug!(
                leg = leg.leg,
                symbol = %leg.symbol,
                %qty,
                %notional,
                %required_qty,
                %required_notional,
                "Checking leg size"
            );

            let mut reasons = Vec::new();
            if qty < required_qty {
                reasons.push(format!("quantity {} < {}", qty.round_dp(8), required_qty));
                worst_ratio = worst_ratio.max(safe_div(required_qty, qty).max(Decimal::ONE));
            }
            if notional < required_notional {
                reasons.push(format!("notional {} < {}", notional.round_dp(8), required_notional));
                worst_ratio =
                    worst_ratio.max(safe_div(required_notional, notional).max(Decimal::ONE));
            }

            if !reasons.is_empty() && first_failure.is_none() {
                first_failure = Some((leg.leg, leg.symbol.clone(), reasons.join(", ")));
            }
        }

        match first_failure {
            None => Ok(()),
            Some((leg, symbol, reason)) => {
                let suggested_min_size = (plan.entry_qty * worst_ratio)
                    .round_dp_with_strategy(2, RoundingStrategy::AwayFromZero);
                warn!(leg, %symbol, %reason, %suggested_min_size, "Order too small");
                Err(ExecutionError::OrderTooSmall {
                    leg,
                    symbol,
                    reason,
                    suggested_min_size,
                })
            }
        }
    }

    /// Check the free balance of leg 1's input asset, inflated by the
    /// connector's buy-cost premium and deflated by the execution buffer.
    pub async fn validate_balance(
        &self,
        connector: &dyn ExchangeConnector,
        plan: &TrianglePlan,
    ) -> Result<(), ExecutionError> {
        let leg = &plan.legs[0];
        let premium = match leg.side {
            OrderSide::Buy => connector.buy_cost_premium(),
            OrderSide::Sell => Decimal::ZERO,
        };
        let required = leg.input_amount * (Decimal::ONE + premium);

        let balances = connector.get_balance().await?;
        let available = balances
            .get(&leg.input_asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO);
        let usable = available * self.config.balance_buffer;

        debug!(asset = %leg.input_asset, %available, %usable, %required, "Checking balance");

        if usable < required {
            let recommended_max = (available * self.config.recommended_balance_fraction)
                .round_dp_with_strategy(2, RoundingStrategy::ToZero);
            warn!(asset = %leg.input_asset, %available, %required, %recommended_max, "Insufficient balance");
            return Err(ExecutionError::InsufficientBalance {
                asset: leg.input_asset.clone(),
                available,
                required,
                recommended_max,
            });
        }

        Ok(())
    }
}
