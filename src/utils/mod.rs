//! Shared utilities.

pub mod decimal;

pub use decimal::{pct_change, round_down_to_step, round_to_step, safe_div};
