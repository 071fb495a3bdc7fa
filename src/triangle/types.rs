//! Triangle opportunity, plan and position types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ExecutionError;
use crate::exchange::OrderSide;
use crate::utils::pct_change;

/// A detected triangular opportunity.
///
/// `symbols` are ordered `[BASE/QUOTE, BASE/BRIDGE, BRIDGE/QUOTE]`; the
/// trade starts and ends in the quote asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangleOpportunity {
    pub id: String,
    pub exchange: String,
    pub symbols: [String; 3],
    pub base_asset: String,
    pub quote_asset: String,
    pub bridge_asset: String,
    /// Profit (%) at discovery time; informational only
    pub expected_profit_pct: Decimal,
    pub consumed: bool,
    pub discovered_at: DateTime<Utc>,
}

/// Direction the triangle is traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriangleDirection {
    /// quote -> base -> bridge -> quote
    Forward,
    /// quote -> bridge -> base -> quote
    Reverse,
}

impl fmt::Display for TriangleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriangleDirection::Forward => write!(f, "forward"),
            TriangleDirection::Reverse => write!(f, "reverse"),
        }
    }
}

/// One planned leg. Immutable once the plan is computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    /// 1-3
    pub leg: u8,
    pub symbol: String,
    pub side: OrderSide,
    pub input_asset: String,
    pub output_asset: String,
    pub input_amount: Decimal,
    pub output_amount: Decimal,
    /// Estimated fee in output units
    pub fee: Decimal,
    pub price: Decimal,
}

/// A fully computed three-leg plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrianglePlan {
    pub direction: TriangleDirection,
    pub legs: [TradeLeg; 3],
    pub entry_qty: Decimal,
    pub expected_return_qty: Decimal,
    pub expected_profit_pct: Decimal,
    pub expected_profit_amount: Decimal,
}

/// Caller's execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub user_id: String,
    /// Entry amount in the quote asset
    pub position_size: Decimal,
    pub max_slippage_pct: Decimal,
    /// Per-attempt timeout; the configured default applies when absent
    pub execution_timeout_secs: Option<u64>,
    pub credential_ref: Option<String>,
}

/// Lifecycle of a triangular position. Forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionStatus {
    #[serde(rename = "VALIDATING")]
    Validating,
    #[serde(rename = "EXECUTING_LEG1")]
    ExecutingLeg1,
    #[serde(rename = "EXECUTING_LEG2")]
    ExecutingLeg2,
    #[serde(rename = "EXECUTING_LEG3")]
    ExecutingLeg3,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Validating => "VALIDATING",
            PositionStatus::ExecutingLeg1 => "EXECUTING_LEG1",
            PositionStatus::ExecutingLeg2 => "EXECUTING_LEG2",
            PositionStatus::ExecutingLeg3 => "EXECUTING_LEG3",
            PositionStatus::Completed => "COMPLETED",
            PositionStatus::Error => "ERROR",
            PositionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "VALIDATING" => Some(PositionStatus::Validating),
            "EXECUTING_LEG1" => Some(PositionStatus::ExecutingLeg1),
            "EXECUTING_LEG2" => Some(PositionStatus::ExecutingLeg2),
            "EXECUTING_LEG3" => Some(PositionStatus::ExecutingLeg3),
            "COMPLETED" => Some(PositionStatus::Completed),
            "ERROR" => Some(PositionStatus::Error),
            "CANCELLED" => Some(PositionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionStatus::Completed | PositionStatus::Error | PositionStatus::Cancelled
        )
    }

    /// Status while leg `leg` (1-3) is in progress.
    pub fn executing(leg: u8) -> Option<Self> {
        match leg {
            1 => Some(PositionStatus::ExecutingLeg1),
            2 => Some(PositionStatus::ExecutingLeg2),
            3 => Some(PositionStatus::ExecutingLeg3),
            _ => None,
        }
    }

    /// Leg currently executing, if any.
    pub fn executing_leg(&self) -> Option<u8> {
        match self {
            PositionStatus::ExecutingLeg1 => Some(1),
            PositionStatus::ExecutingLeg2 => Some(2),
            PositionStatus::ExecutingLeg3 => Some(3),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only order.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Error | Cancelled => true,
            ExecutingLeg1 => *self == Validating,
            ExecutingLeg2 => *self == ExecutingLeg1,
            ExecutingLeg3 => *self == ExecutingLeg2,
            Completed => *self == ExecutingLeg3,
            Validating => false,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution record of one leg, present once the leg returned a fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegExecution {
    pub leg: u8,
    pub symbol: String,
    pub side: OrderSide,
    pub planned_qty: Decimal,
    pub planned_price: Decimal,
    pub order_id: String,
    pub filled_qty: Decimal,
    /// Amount received, net of fees (base for buys, quote for sells)
    pub output_amount: Decimal,
    pub avg_price: Decimal,
    pub fees: Decimal,
    pub executed_at: DateTime<Utc>,
}

impl LegExecution {
    /// Signed slippage (%) of the fill against the planned price.
    pub fn slippage_pct(&self) -> Decimal {
        pct_change(self.planned_price, self.avg_price)
    }
}

/// Final figures of a completed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResults {
    pub final_qty: Decimal,
    pub actual_profit_pct: Decimal,
    pub actual_profit_amount: Decimal,
    pub total_fees: Decimal,
    pub leg_slippage_pct: [Decimal; 3],
    pub total_slippage_pct: Decimal,
}

/// Persisted aggregate for one triangle execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangularPosition {
    pub id: String,
    pub user_id: String,
    pub exchange: String,
    pub credential_ref: Option<String>,
    pub opportunity_id: String,

    // Plan
    pub symbols: [String; 3],
    pub base_asset: String,
    pub quote_asset: String,
    pub bridge_asset: String,
    pub direction: TriangleDirection,
    pub entry_qty: Decimal,
    pub expected_return_qty: Decimal,
    pub expected_profit_pct: Decimal,
    pub expected_profit_amount: Decimal,
    pub max_slippage_pct: Decimal,
    pub execution_timeout_secs: u64,

    pub legs: [Option<LegExecution>; 3],

    pub status: PositionStatus,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: Option<ExecutionResults>,
}

impl TriangularPosition {
    /// New position in `VALIDATING` built from a recomputed plan.
    pub fn new(
        id: String,
        opportunity: &TriangleOpportunity,
        plan: &TrianglePlan,
        request: &ExecutionRequest,
        execution_timeout_secs: u64,
    ) -> Self {
        Self {
            id,
            user_id: request.user_id.clone(),
            exchange: opportunity.exchange.clone(),
            credential_ref: request.credential_ref.clone(),
            opportunity_id: opportunity.id.clone(),
            symbols: opportunity.symbols.clone(),
            base_asset: opportunity.base_asset.clone(),
            quote_asset: opportunity.quote_asset.clone(),
            bridge_asset: opportunity.bridge_asset.clone(),
            direction: plan.direction,
            entry_qty: plan.entry_qty,
            expected_return_qty: plan.expected_return_qty,
            expected_profit_pct: plan.expected_profit_pct,
            expected_profit_amount: plan.expected_profit_amount,
            max_slippage_pct: request.max_slippage_pct,
            execution_timeout_secs,
            legs: [None, None, None],
            status: PositionStatus::Validating,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            results: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn leg(&self, leg: u8) -> Option<&LegExecution> {
        self.legs
            .get(usize::from(leg).checked_sub(1)?)
            .and_then(|l| l.as_ref())
    }

    /// Completed legs in execution order.
    pub fn completed_legs(&self) -> impl DoubleEndedIterator<Item = &LegExecution> {
        self.legs.iter().flatten()
    }

    /// Move to `next`, enforcing the forward-only order.
    pub fn transition(&mut self, next: PositionStatus) -> Result<(), ExecutionError> {
        if !self.status.can_transition_to(next) {
            return Err(ExecutionError::InvalidTransition {
                position_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Store a leg's execution record and advance to the next leg.
    ///
    /// Leg n may only be recorded while leg n is executing, which implies
    /// legs 1..n-1 are already populated. A cancelled position still takes
    /// the fill of the order that was in flight when the cancel landed, so
    /// the exchange exposure stays reconstructible; its status stays
    /// `CANCELLED`.
    pub fn record_leg(&mut self, execution: LegExecution) -> Result<(), ExecutionError> {
        let leg = execution.leg;
        let cancelled = self.status == PositionStatus::Cancelled;
        let expected = if cancelled {
            (1..=3).contains(&leg)
        } else {
            self.status.executing_leg() == Some(leg)
        };
        let in_order = expected
            && (leg == 1 || self.leg(leg - 1).is_some())
            && self.leg(leg).is_none();
        if !in_order {
            return Err(ExecutionError::InvalidTransition {
                position_id: self.id.clone(),
                from: self.status.to_string(),
                to: format!("leg {} recorded", leg),
            });
        }

        self.legs[usize::from(leg - 1)] = Some(execution);
        if cancelled {
            return Ok(());
        }
        if let Some(next) = PositionStatus::executing(leg + 1) {
            self.transition(next)?;
        }
        Ok(())
    }

    /// Mark the position `ERROR`, keeping all partial leg data.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), ExecutionError> {
        self.transition(PositionStatus::Error)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn cancel(&mut self, message: impl Into<String>) -> Result<(), ExecutionError> {
        self.transition(PositionStatus::Cancelled)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Compute final figures from the recorded legs. `None` until leg 3 is recorded.
    pub fn compute_results(&self) -> Option<ExecutionResults> {
        let last = self.leg(3)?;
        let legs: Vec<&LegExecution> = self.completed_legs().collect();
        if legs.len() != 3 {
            return None;
        }

        let final_qty = last.output_amount;
        let total_fees = legs.iter().map(|l| l.fees).sum();
        let leg_slippage_pct = [
            legs[0].slippage_pct(),
            legs[1].slippage_pct(),
            legs[2].slippage_pct(),
        ];

        Some(ExecutionResults {
            final_qty,
            actual_profit_pct: pct_change(self.entry_qty, final_qty),
            actual_profit_amount: final_qty - self.entry_qty,
            total_fees,
            leg_slippage_pct,
            total_slippage_pct: leg_slippage_pct.iter().sum(),
        })
    }

    /// Store final results and mark the position `COMPLETED`.
    pub fn complete(&mut self, results: ExecutionResults) -> Result<(), ExecutionError> {
        self.transition(PositionStatus::Completed)?;
        self.results = Some(results);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn leg(leg: u8, symbol: &str, side: OrderSide, input: Decimal, output: Decimal, price: Decimal) -> TradeLeg {
        TradeLeg {
            leg,
            symbol: symbol.to_string(),
            side,
            input_asset: String::new(),
            output_asset: String::new(),
            input_amount: input,
            output_amount: output,
            fee: Decimal::ZERO,
            price,
        }
    }

    fn sample_position() -> TriangularPosition {
        let opportunity = TriangleOpportunity {
            id: "opp-1".to_string(),
            exchange: "bybit".to_string(),
            symbols: ["ETHUSDT".to_string(), "ETHBTC".to_string(), "BTCUSDT".to_string()],
            base_asset: "ETH".to_string(),
            quote_asset: "USDT".to_string(),
            bridge_asset: "BTC".to_string(),
            expected_profit_pct: dec!(0.1),
            consumed: false,
            discovered_at: Utc::now(),
        };
        let plan = TrianglePlan {
            direction: TriangleDirection::Forward,
            legs: [
                leg(1, "ETHUSDT", OrderSide::Buy, dec!(100), dec!(10), dec!(10)),
                leg(2, "ETHBTC", OrderSide::Sell, dec!(10), dec!(5), dec!(0.5)),
                leg(3, "BTCUSDT", OrderSide::Sell, dec!(5), dec!(100), dec!(20)),
            ],
            entry_qty: dec!(100),
            expected_return_qty: dec!(100),
            expected_profit_pct: Decimal::ZERO,
            expected_profit_amount: Decimal::ZERO,
        };
        let request = ExecutionRequest {
            user_id: "user-1".to_string(),
            position_size: dec!(100),
            max_slippage_pct: dec!(0.5),
            execution_timeout_secs: None,
            credential_ref: None,
        };
        TriangularPosition::new("pos-1".to_string(), &opportunity, &plan, &request, 30)
    }

    fn execution(leg: u8, avg: Decimal, planned: Decimal, output: Decimal) -> LegExecution {
        LegExecution {
            leg,
            symbol: format!("SYM{}", leg),
            side: OrderSide::Sell,
            planned_qty: dec!(1),
            planned_price: planned,
            order_id: format!("o{}", leg),
            filled_qty: dec!(1),
            output_amount: output,
            avg_price: avg,
            fees: dec!(0.1),
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_round_trip_and_order() {
        for status in [
            PositionStatus::Validating,
            PositionStatus::ExecutingLeg2,
            PositionStatus::Cancelled,
        ] {
            assert_eq!(PositionStatus::parse(status.as_str()), Some(status));
        }
        assert!(PositionStatus::ExecutingLeg1.can_transition_to(PositionStatus::ExecutingLeg2));
        assert!(!PositionStatus::ExecutingLeg1.can_transition_to(PositionStatus::ExecutingLeg3));
        assert!(!PositionStatus::Completed.can_transition_to(PositionStatus::Error));
        assert!(!PositionStatus::Cancelled.can_transition_to(PositionStatus::Cancelled));
    }

    #[test]
    fn test_leg_cannot_skip_ahead() {
        let mut position = sample_position();
        position.transition(PositionStatus::ExecutingLeg1).unwrap();

        let err = position
            .record_leg(execution(2, dec!(1), dec!(1), dec!(1)))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidTransition { .. }));
        assert!(position.leg(2).is_none());

        position.record_leg(execution(1, dec!(1), dec!(1), dec!(1))).unwrap();
        assert_eq!(position.status, PositionStatus::ExecutingLeg2);
        assert!(position.record_leg(execution(1, dec!(1), dec!(1), dec!(1))).is_err());
    }

    #[test]
    fn test_results_from_recorded_legs() {
        let mut position = sample_position();
        position.transition(PositionStatus::ExecutingLeg1).unwrap();
        position.record_leg(execution(1, dec!(10.1), dec!(10), dec!(9.9))).unwrap();
        position.record_leg(execution(2, dec!(0.5), dec!(0.5), dec!(4.9))).unwrap();
        assert!(position.compute_results().is_none());
        position.record_leg(execution(3, dec!(20), dec!(20), dec!(101))).unwrap();
        assert_eq!(position.status, PositionStatus::ExecutingLeg3);

        let results = position.compute_results().unwrap();
        assert_eq!(results.final_qty, dec!(101));
        assert_eq!(results.actual_profit_pct, dec!(1));
        assert_eq!(results.actual_profit_amount, dec!(1));
        assert_eq!(results.total_fees, dec!(0.3));
        assert_eq!(results.leg_slippage_pct[0], dec!(1));
        assert_eq!(results.total_slippage_pct, dec!(1));

        position.complete(results).unwrap();
        assert!(position.is_terminal());
        assert!(position.completed_at.is_some());
        assert!(position.cancel("too late").is_err());
    }

    #[test]
    fn test_failure_keeps_partial_legs() {
        let mut position = sample_position();
        position.transition(PositionStatus::ExecutingLeg1).unwrap();
        position.record_leg(execution(1, dec!(10), dec!(10), dec!(9.9))).unwrap();
        position.fail("leg 2 failed").unwrap();

        assert_eq!(position.status, PositionStatus::Error);
        assert!(position.leg(1).is_some());
        assert_eq!(position.error_message.as_deref(), Some("leg 2 failed"));
    }

    #[test]
    fn test_cancelled_position_keeps_in_flight_fill() {
        let mut position = sample_position();
        position.transition(PositionStatus::ExecutingLeg1).unwrap();
        position.record_leg(execution(1, dec!(10), dec!(10), dec!(9.9))).unwrap();
        position.cancel("cancelled by user").unwrap();

        // Leg 2 was in flight when the cancel landed
        position.record_leg(execution(2, dec!(0.5), dec!(0.5), dec!(4.9))).unwrap();
        assert_eq!(position.status, PositionStatus::Cancelled);
        assert!(position.leg(2).is_some());

        // Still in order, still once per leg
        assert!(position.record_leg(execution(2, dec!(0.5), dec!(0.5), dec!(4.9))).is_err());
        assert!(position.record_leg(execution(0, dec!(1), dec!(1), dec!(1))).is_err());
    }
}
