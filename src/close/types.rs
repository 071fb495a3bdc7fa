//! Close request and result types.

use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::exchange::PositionSide;

/// Which side of the book an exit paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeType {
    Maker,
    Taker,
}

impl fmt::Display for FeeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeType::Maker => write!(f, "maker"),
            FeeType::Taker => write!(f, "taker"),
        }
    }
}

/// Request to close a primary position and its hedge.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseOptions {
    pub primary_symbol: String,
    pub hedge_symbol: String,
    /// Direction of the primary position; the hedge is the opposite
    pub primary_side: PositionSide,
    pub quantity: Decimal,
    /// Overrides the strategy's default max wait
    pub max_wait: Option<Duration>,
    /// Overrides the configured aggressive price margin
    pub aggressive_margin: Option<Decimal>,
}

impl CloseOptions {
    pub fn new(
        primary_symbol: impl Into<String>,
        hedge_symbol: impl Into<String>,
        primary_side: PositionSide,
        quantity: Decimal,
    ) -> Self {
        Self {
            primary_symbol: primary_symbol.into(),
            hedge_symbol: hedge_symbol.into(),
            primary_side,
            quantity,
            max_wait: None,
            aggressive_margin: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn hedge_side(&self) -> PositionSide {
        self.primary_side.opposite()
    }
}

/// Identifies one of the two legs being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRole {
    Primary,
    Hedge,
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegRole::Primary => write!(f, "primary"),
            LegRole::Hedge => write!(f, "hedge"),
        }
    }
}

/// Outcome of closing one leg.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LegClose {
    pub closed: bool,
    pub exit_price: Option<Decimal>,
    /// `None` when no order was needed (position already flat)
    pub fee_type: Option<FeeType>,
}

impl LegClose {
    pub fn already_flat() -> Self {
        Self {
            closed: true,
            exit_price: None,
            fee_type: None,
        }
    }

    pub fn filled(exit_price: Option<Decimal>, fee_type: FeeType) -> Self {
        Self {
            closed: true,
            exit_price,
            fee_type: Some(fee_type),
        }
    }
}

/// Result of a two-leg close.
///
/// Either both legs are closed (`success`), or `success` is false, both
/// flags are false and `remaining_open` names what still needs attention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseResult {
    pub success: bool,
    pub primary_closed: bool,
    pub hedge_closed: bool,
    pub primary_exit_price: Option<Decimal>,
    pub hedge_exit_price: Option<Decimal>,
    pub elapsed_ms: u64,
    pub strategy: String,
    pub primary_fee_type: Option<FeeType>,
    pub hedge_fee_type: Option<FeeType>,
    pub error: Option<String>,
    pub remaining_open: Vec<String>,
}

impl CloseResult {
    pub fn closed(strategy: &str, primary: LegClose, hedge: LegClose, elapsed: Duration) -> Self {
        Self {
            success: true,
            primary_closed: true,
            hedge_closed: true,
            primary_exit_price: primary.exit_price,
            hedge_exit_price: hedge.exit_price,
            elapsed_ms: elapsed.as_millis() as u64,
            strategy: strategy.to_string(),
            primary_fee_type: primary.fee_type,
            hedge_fee_type: hedge.fee_type,
            error: None,
            remaining_open: Vec::new(),
        }
    }

    pub fn failed(
        strategy: &str,
        error: String,
        remaining_open: Vec<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: false,
            primary_closed: false,
            hedge_closed: false,
            primary_exit_price: None,
            hedge_exit_price: None,
            elapsed_ms: elapsed.as_millis() as u64,
            strategy: strategy.to_string(),
            primary_fee_type: None,
            hedge_fee_type: None,
            error: Some(error),
            remaining_open,
        }
    }
}
