//! Triangle execution orchestrator.
//!
//! Drives one opportunity through recompute, validation, three sequential
//! legs and finalization. Each leg's size derives from the previous leg's
//! actual fill. Legs retry a fixed number of times; once a later leg gives
//! up, every completed leg is reversed with an opposite market order.
//!
//! An order call that outlives its attempt timeout is never abandoned and
//! resubmitted: it may already have filled. It gets one more timeout to
//! report back, after which the leg fails with its outcome unknown.

use anyhow::{anyhow, Context};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::calculator::PlanCalculator;
use super::limits_cache::SymbolLimitsCache;
use super::types::*;
use super::validator::TradeValidator;
use crate::config::TriangleConfig;
use crate::error::ExecutionError;
use crate::exchange::{ExchangeConnector, OrderFill, OrderSide, SymbolLimits};
use crate::persistence::{OpportunitySource, PositionStore};
use crate::utils::{round_down_to_step, safe_div};

const CANCEL_MESSAGE: &str =
    "Cancelled by user before completion; legs already filled were not reversed";

/// Executes triangular opportunities against one exchange connector.
pub struct TriangleOrchestrator {
    connector: Arc<dyn ExchangeConnector>,
    store: Arc<dyn PositionStore>,
    opportunities: Arc<dyn OpportunitySource>,
    calculator: Arc<dyn PlanCalculator>,
    limits: Arc<SymbolLimitsCache>,
    validator: TradeValidator,
    config: TriangleConfig,
    /// Positions executing in this process, with their cancel-requested flag
    in_flight: RwLock<HashMap<String, bool>>,
}

impl TriangleOrchestrator {
    pub fn new(
        connector: Arc<dyn ExchangeConnector>,
        store: Arc<dyn PositionStore>,
        opportunities: Arc<dyn OpportunitySource>,
        calculator: Arc<dyn PlanCalculator>,
        limits: Arc<SymbolLimitsCache>,
        config: TriangleConfig,
    ) -> Self {
        let validator = TradeValidator::new(limits.clone(), config.clone());
        Self {
            connector,
            store,
            opportunities,
            calculator,
            limits,
            validator,
            config,
            in_flight: RwLock::new(HashMap::new()),
        }
    }

    /// Execute an opportunity with the caller's requested size.
    ///
    /// Pre-trade failures (stale plan, size, balance) return before any
    /// position is created. Once legs start, every outcome is persisted:
    /// `COMPLETED`, `ERROR` with the failing leg's message, or `CANCELLED`.
    #[instrument(skip(self, request), fields(exchange = %self.connector.exchange_name(), size = %request.position_size))]
    pub async fn execute_opportunity(
        &self,
        opportunity_id: &str,
        request: ExecutionRequest,
    ) -> Result<TriangularPosition, ExecutionError> {
        let opportunity = self
            .opportunities
            .get_opportunity(opportunity_id)
            .await?
            .ok_or_else(|| ExecutionError::OpportunityNotFound(opportunity_id.to_string()))?;

        if opportunity.consumed {
            return Err(ExecutionError::OpportunityConsumed(opportunity.id));
        }

        let connector_exchange = self.connector.exchange_name();
        if !opportunity.exchange.eq_ignore_ascii_case(&connector_exchange) {
            return Err(ExecutionError::ExchangeMismatch {
                opportunity_exchange: opportunity.exchange,
                connector_exchange,
            });
        }

        // Never trust the plan the opportunity was discovered with
        let prices = self.fetch_prices(&opportunity).await?;
        let plan = self
            .calculator
            .calculate(&opportunity, prices, request.position_size)
            .ok_or(ExecutionError::StalePlan)?;

        info!(
            direction = %plan.direction,
            expected_return = %plan.expected_return_qty,
            expected_profit_pct = %plan.expected_profit_pct,
            "Recomputed triangle plan"
        );

        self.validator
            .validate_order_sizes(self.connector.as_ref(), &plan)
            .await?;
        self.validator
            .validate_balance(self.connector.as_ref(), &plan)
            .await?;

        let timeout_secs = request
            .execution_timeout_secs
            .unwrap_or(self.config.execution_timeout_secs);
        let mut position = TriangularPosition::new(
            Uuid::new_v4().to_string(),
            &opportunity,
            &plan,
            &request,
            timeout_secs,
        );
        position.transition(PositionStatus::ExecutingLeg1)?;
        self.store.create_position(&position).await?;

        // Claimed only once the position exists, so a failed create leaves
        // the opportunity executable. Losing the claim race fails the
        // position before any order is placed.
        if let Err(e) = self.opportunities.mark_consumed(&opportunity.id).await {
            let err = e.context(format!("Failed to claim opportunity {}", opportunity.id));
            let message = format!("{:#}", err);
            warn!(position_id = %position.id, error = %message, "Opportunity claim failed, no orders placed");
            let _ = position.fail(message.clone());
            if let Err(e) = self
                .store
                .update_status(&position.id, PositionStatus::Error, Some(message))
                .await
            {
                error!(position_id = %position.id, error = %e, "Failed to persist position failure");
            }
            return Err(err.into());
        }

        info!(position_id = %position.id, "Position created, executing legs");

        self.in_flight.write().await.insert(position.id.clone(), false);
        let outcome = match self.run_legs(&mut position, &plan).await {
            Ok(()) => {
                info!(
                    position_id = %position.id,
                    final_qty = ?position.results.as_ref().map(|r| r.final_qty),
                    profit_pct = ?position.results.as_ref().map(|r| r.actual_profit_pct),
                    "Triangle completed"
                );
                Ok(())
            }
            Err(err) => Err(self.handle_failure(&mut position, err).await),
        };
        self.in_flight.write().await.remove(&position.id);

        outcome.map(|()| position)
    }

    async fn run_legs(
        &self,
        position: &mut TriangularPosition,
        plan: &TrianglePlan,
    ) -> Result<(), ExecutionError> {
        let attempt_timeout = Duration::from_secs(position.execution_timeout_secs);
        let mut carried = plan.entry_qty;

        for planned in &plan.legs {
            if self.is_cancelled(&position.id).await {
                info!(position_id = %position.id, leg = planned.leg, "Cancellation observed, stopping before leg");
                return Err(ExecutionError::Cancelled(position.id.clone()));
            }

            let execution = self
                .execute_leg_with_retry(planned, carried, attempt_timeout)
                .await?;

            // Recorded even if a cancel landed meanwhile: the fill happened
            carried = execution.output_amount * self.config.carry_forward_factor;
            position.record_leg(execution.clone())?;
            self.store.update_leg(&position.id, &execution).await?;

            info!(
                position_id = %position.id,
                leg = execution.leg,
                symbol = %execution.symbol,
                filled = %execution.filled_qty,
                avg_price = %execution.avg_price,
                received = %execution.output_amount,
                %carried,
                "Leg filled"
            );
        }

        // A cancel that landed while leg 3 was in flight still wins
        if self.is_cancelled(&position.id).await {
            return Err(ExecutionError::Cancelled(position.id.clone()));
        }

        let results = position
            .compute_results()
            .ok_or_else(|| anyhow!("position {} is missing leg records", position.id))?;
        self.store.update_results(&position.id, &results).await?;
        position.complete(results)?;
        Ok(())
    }

    /// Reverse completed legs (unless cancelled) and persist the failure.
    async fn handle_failure(
        &self,
        position: &mut TriangularPosition,
        err: ExecutionError,
    ) -> ExecutionError {
        if matches!(err, ExecutionError::Cancelled(_)) || self.is_cancelled(&position.id).await {
            if !position.is_terminal() {
                let _ = position.cancel(CANCEL_MESSAGE);
            }
            return ExecutionError::Cancelled(position.id.clone());
        }

        if position.completed_legs().next().is_some() {
            self.reverse_legs(position).await;
        }

        let message = err.to_string();
        error!(position_id = %position.id, error = %message, "Triangle execution failed");

        if !position.is_terminal() {
            let _ = position.fail(message.clone());
        }
        if let Err(e) = self
            .store
            .update_status(&position.id, PositionStatus::Error, Some(message))
            .await
        {
            error!(position_id = %position.id, error = %e, "Failed to persist position failure");
        }

        err
    }

    /// Place the leg's order, retrying with a fixed delay.
    async fn execute_leg_with_retry(
        &self,
        planned: &TradeLeg,
        carried: Decimal,
        attempt_timeout: Duration,
    ) -> Result<LegExecution, ExecutionError> {
        let limits = self
            .limits
            .get_or_fetch(self.connector.as_ref(), &planned.symbol)
            .await?;
        let quantity = self.order_quantity(planned, carried, &limits);
        let max_attempts = self.config.max_attempts;

        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::LegFailed {
                leg: planned.leg,
                attempts: 0,
                reason: format!("order quantity for {} rounds to zero", planned.symbol),
            });
        }

        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            debug!(leg = planned.leg, symbol = %planned.symbol, side = %planned.side, %quantity, attempt, "Placing leg order");

            match self.place_leg_order(planned, quantity, attempt_timeout).await {
                Ok(fill) => return Ok(Self::to_execution(planned, quantity, fill)),
                Err(e @ ExecutionError::OrderOutcomeUnknown { .. }) => {
                    error!(
                        leg = planned.leg,
                        symbol = %planned.symbol,
                        attempt,
                        error = %e,
                        "Leg order outcome unknown, not resubmitting"
                    );
                    return Err(ExecutionError::LegFailed {
                        leg: planned.leg,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        leg = planned.leg,
                        symbol = %planned.symbol,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Leg order failed, retrying"
                    );
                    last_error = e.to_string();

                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        Err(ExecutionError::LegFailed {
            leg: planned.leg,
            attempts: max_attempts,
            reason: last_error,
        })
    }

    async fn place_leg_order(
        &self,
        planned: &TradeLeg,
        quantity: Decimal,
        attempt_timeout: Duration,
    ) -> Result<OrderFill, ExecutionError> {
        let mut order = self
            .connector
            .place_market_order(&planned.symbol, planned.side, quantity);

        let response = match tokio::time::timeout(attempt_timeout, &mut order).await {
            Ok(response) => response?,
            Err(_) => {
                warn!(
                    leg = planned.leg,
                    symbol = %planned.symbol,
                    timeout = ?attempt_timeout,
                    "Order still in flight after attempt timeout, waiting for its result"
                );
                tokio::time::timeout(attempt_timeout, &mut order)
                    .await
                    .map_err(|_| ExecutionError::OrderOutcomeUnknown {
                        symbol: planned.symbol.clone(),
                        waited_secs: attempt_timeout.as_secs() * 2,
                    })??
            }
        };

        let fill = response.normalize();
        if fill.filled_qty <= Decimal::ZERO {
            return Err(ExecutionError::ZeroFill {
                order_id: fill.order_id,
                symbol: planned.symbol.clone(),
            });
        }
        Ok(fill)
    }

    /// Order quantity from the carried amount: quote converted at the
    /// planned price (deflated by the buy premium) for buys, base as-is for
    /// sells. Always rounded down to the quantity step.
    fn order_quantity(&self, planned: &TradeLeg, carried: Decimal, limits: &SymbolLimits) -> Decimal {
        let raw = match planned.side {
            OrderSide::Buy => {
                let premium = self.connector.buy_cost_premium();
                safe_div(carried, planned.price * (Decimal::ONE + premium))
            }
            OrderSide::Sell => carried,
        };
        round_down_to_step(raw, limits.qty_step)
    }

    /// Amount of the leg's output asset actually received.
    ///
    /// A buy receives `filled` base and a sell `filled * price` quote; fees
    /// come off only when charged in the asset being measured (base on a
    /// sell is converted at the fill price). Fees in some other asset leave
    /// the amount alone. Fees with no reported currency are taken off as if
    /// quote-denominated, which can under-carry but never over-carry.
    fn received_amount(planned: &TradeLeg, fill: &OrderFill) -> Decimal {
        let charged_in = |asset: &str| {
            fill.fee_currency
                .as_deref()
                .map(|currency| currency.eq_ignore_ascii_case(asset))
        };

        match planned.side {
            OrderSide::Buy => match charged_in(&planned.output_asset) {
                Some(true) => fill.filled_qty - fill.total_fees,
                Some(false) => fill.filled_qty,
                None => fill.filled_qty - safe_div(fill.total_fees, fill.avg_price),
            },
            OrderSide::Sell => {
                let proceeds = fill.filled_qty * fill.avg_price;
                match (charged_in(&planned.output_asset), charged_in(&planned.input_asset)) {
                    (Some(true), _) | (None, _) => proceeds - fill.total_fees,
                    (_, Some(true)) => proceeds - fill.total_fees * fill.avg_price,
                    _ => proceeds,
                }
            }
        }
    }

    fn to_execution(planned: &TradeLeg, planned_qty: Decimal, fill: OrderFill) -> LegExecution {
        let received = Self::received_amount(planned, &fill);

        LegExecution {
            leg: planned.leg,
            symbol: planned.symbol.clone(),
            side: planned.side,
            planned_qty,
            planned_price: planned.price,
            order_id: fill.order_id,
            filled_qty: fill.filled_qty,
            output_amount: received.max(Decimal::ZERO),
            avg_price: fill.avg_price,
            fees: fill.total_fees,
            executed_at: Utc::now(),
        }
    }

    /// Best-effort compensation: undo completed legs newest first. Failures
    /// are logged and never surfaced.
    async fn reverse_legs(&self, position: &TriangularPosition) {
        for leg in position.completed_legs().rev() {
            let side = leg.side.opposite();
            warn!(
                position_id = %position.id,
                leg = leg.leg,
                symbol = %leg.symbol,
                %side,
                quantity = %leg.filled_qty,
                "Reversing leg"
            );

            if let Err(e) = self
                .connector
                .place_market_order(&leg.symbol, side, leg.filled_qty)
                .await
            {
                error!(
                    position_id = %position.id,
                    leg = leg.leg,
                    symbol = %leg.symbol,
                    error = %e,
                    "CRITICAL: Failed to reverse leg, manual intervention required"
                );
            }
        }
    }

    async fn fetch_prices(
        &self,
        opportunity: &TriangleOpportunity,
    ) -> Result<[Decimal; 3], ExecutionError> {
        let [s1, s2, s3] = &opportunity.symbols;
        let (p1, p2, p3) = tokio::try_join!(
            self.connector.get_market_price(s1),
            self.connector.get_market_price(s2),
            self.connector.get_market_price(s3),
        )
        .context("Failed to fetch current prices")?;
        Ok([p1, p2, p3])
    }

    async fn is_cancelled(&self, position_id: &str) -> bool {
        if self.in_flight.read().await.get(position_id).copied().unwrap_or(false) {
            return true;
        }
        // Cancellation may come from another process sharing the store
        matches!(
            self.store.get_position(position_id).await,
            Ok(Some(p)) if p.status == PositionStatus::Cancelled
        )
    }

    /// Flag an execution running in this process; others see the store.
    async fn set_cancel_requested(&self, position_id: &str, requested: bool) {
        if let Some(flag) = self.in_flight.write().await.get_mut(position_id) {
            *flag = requested;
        }
    }

    /// Cancel a position that has not completed. Completed legs are not
    /// reversed; an in-flight execution stops before its next leg.
    #[instrument(skip(self))]
    pub async fn cancel_position(
        &self,
        position_id: &str,
    ) -> Result<TriangularPosition, ExecutionError> {
        let position = self.get_position(position_id).await?;
        if position.is_terminal() {
            return Err(ExecutionError::InvalidTransition {
                position_id: position_id.to_string(),
                from: position.status.to_string(),
                to: PositionStatus::Cancelled.to_string(),
            });
        }

        self.set_cancel_requested(position_id, true).await;

        if let Err(e) = self
            .store
            .update_status(
                position_id,
                PositionStatus::Cancelled,
                Some(CANCEL_MESSAGE.to_string()),
            )
            .await
        {
            self.set_cancel_requested(position_id, false).await;
            return Err(e.into());
        }

        info!(%position_id, status_before = %position.status, "Position cancelled");
        self.get_position(position_id).await
    }

    pub async fn get_position(
        &self,
        position_id: &str,
    ) -> Result<TriangularPosition, ExecutionError> {
        self.store
            .get_position(position_id)
            .await?
            .ok_or_else(|| ExecutionError::PositionNotFound(position_id.to_string()))
    }

    pub async fn list_positions(
        &self,
        user_id: &str,
    ) -> Result<Vec<TriangularPosition>, ExecutionError> {
        Ok(self.store.list_positions(Some(user_id)).await?)
    }
}
