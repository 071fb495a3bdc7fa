//! Decimal arithmetic helpers for quantities and prices.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round down to a quantity step (lot size). A zero step leaves the value as is.
///
/// Order quantities are always rounded down so a carried amount is never
/// overspent.
pub fn round_down_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

/// Round to the nearest price step (tick size).
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).round() * step).normalize()
}

/// Percentage change from `from` to `to`, e.g. 100 -> 101 is 1.
///
/// Zero base yields zero.
pub fn pct_change(from: Decimal, to: Decimal) -> Decimal {
    if from.is_zero() {
        return Decimal::ZERO;
    }
    (to - from) / from * dec!(100)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}
