//! Triangular arbitrage execution.
//!
//! - `types`: opportunity, plan and the persisted position aggregate
//! - `calculator`: plan recomputation from live prices
//! - `validator`: minimum-size and balance pre-flight checks
//! - `limits_cache`: per-(exchange, symbol) trading rules
//! - `orchestrator`: sequential leg execution with retry and reversal

pub mod calculator;
pub mod limits_cache;
pub mod orchestrator;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod fixtures;

pub use calculator::{PlanCalculator, TriangleCalculator};
pub use limits_cache::SymbolLimitsCache;
pub use orchestrator::TriangleOrchestrator;
pub use types::*;
pub use validator::TradeValidator;
