//! Typed errors for triangle execution and position closing.
//!
//! Connector and persistence calls return `anyhow::Result`; the variants
//! here carry the data a caller needs to act on a failure (which leg, how
//! much balance is missing, what size would pass).

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised while planning, validating or executing a triangle.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("opportunity is no longer profitable at current market prices; refresh opportunities and retry")]
    StalePlan,

    #[error(
        "leg {leg} order on {symbol} is below exchange minimums ({reason}); \
         increase position size to at least {suggested_min_size}"
    )]
    OrderTooSmall {
        leg: u8,
        symbol: String,
        reason: String,
        suggested_min_size: Decimal,
    },

    #[error(
        "insufficient {asset} balance: available {available}, required {required}; \
         recommended max position size {recommended_max}"
    )]
    InsufficientBalance {
        asset: String,
        available: Decimal,
        required: Decimal,
        recommended_max: Decimal,
    },

    #[error("order {order_id} on {symbol} returned zero fill")]
    ZeroFill { order_id: String, symbol: String },

    #[error(
        "{symbol} order got no response within {waited_secs}s and its outcome is unknown; \
         check the account before trading this leg again"
    )]
    OrderOutcomeUnknown { symbol: String, waited_secs: u64 },

    #[error("leg {leg} failed after {attempts} attempts: {reason}")]
    LegFailed { leg: u8, attempts: u32, reason: String },

    #[error("position {0} was cancelled")]
    Cancelled(String),

    #[error("position {0} not found")]
    PositionNotFound(String),

    #[error("opportunity {0} not found")]
    OpportunityNotFound(String),

    #[error("opportunity {0} has already been executed")]
    OpportunityConsumed(String),

    #[error("opportunity is on {opportunity_exchange} but the connector is {connector_exchange}")]
    ExchangeMismatch {
        opportunity_exchange: String,
        connector_exchange: String,
    },

    #[error("position {position_id} cannot move from {from} to {to}")]
    InvalidTransition {
        position_id: String,
        from: String,
        to: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutionError {
    /// Validation and planning errors are raised before any order is placed.
    pub fn is_pre_trade(&self) -> bool {
        matches!(
            self,
            ExecutionError::StalePlan
                | ExecutionError::OrderTooSmall { .. }
                | ExecutionError::InsufficientBalance { .. }
                | ExecutionError::OpportunityNotFound(_)
                | ExecutionError::OpportunityConsumed(_)
                | ExecutionError::ExchangeMismatch { .. }
        )
    }
}

/// Errors raised on the close path.
#[derive(Debug, Error)]
pub enum CloseError {
    #[error(
        "MANUAL INTERVENTION REQUIRED: failed to close {symbol} on {exchange} \
         (reduce-only: {reduce_only_error}; close-position: {close_error}); close this position manually"
    )]
    ManualInterventionRequired {
        exchange: String,
        symbol: String,
        reduce_only_error: String,
        close_error: String,
    },

    #[error("no fresh price for {symbol} on {exchange}")]
    PriceUnavailable { exchange: String, symbol: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
