//! Position-close framework.
//!
//! Closes a primary position together with its hedge. Two strategies exist:
//! - [`UltraFastStrategy`]: aggressive limit orders with push fill tracking,
//!   for exchange pairs that both stream order updates
//! - [`HybridStrategy`]: limit orders with position polling, for everything else
//!
//! Every path that takes liquidity goes through [`safe_close`], which only
//! uses reduce-only orders or the exchange's close-position call.

mod hybrid;
mod price_cache;
mod safe_close;
mod strategy;
mod types;
mod ultra_fast;

pub use hybrid::HybridStrategy;
pub use price_cache::PriceCache;
pub use safe_close::{aggressive_limit_price, emergency_close, is_already_closed_error, safe_close};
pub use strategy::{select_strategy_kind, CloseStrategy, StrategyFactory, StrategyKind};
pub use types::{CloseOptions, CloseResult, FeeType, LegClose, LegRole};
pub use ultra_fast::UltraFastStrategy;
