//! # Multi-Leg Engine
//!
//! Multi-leg trade orchestration and safe hedge closing across exchanges.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `error`: Typed execution and close errors
//! - `exchange`: Connector trait, capability registry, push decoders, mock exchange
//! - `triangle`: Triangular arbitrage planning, validation and 3-leg execution
//! - `close`: Ultra-Fast and Hybrid close strategies with the safe-close invariant
//! - `persistence`: Position and opportunity storage (in-memory and SQLite)
//! - `utils`: Shared utilities and decimal arithmetic

pub mod close;
pub mod config;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod triangle;
pub mod utils;

pub use config::Config;
pub use error::{CloseError, ExecutionError};
