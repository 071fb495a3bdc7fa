//! Configuration management for the execution engine.
//!
//! Loads settings from an optional `config` file and `MLE__*` environment
//! variables (e.g. `MLE__TRIANGLE__MAX_ATTEMPTS=5`).

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Triangle execution parameters
    #[serde(default)]
    pub triangle: TriangleConfig,
    /// Position-close parameters
    #[serde(default)]
    pub close: CloseConfig,
    /// Storage settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangleConfig {
    /// Attempts per leg before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between leg attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Slippage buffer compounded per prior leg when validating sizes
    #[serde(default = "default_slippage_buffer_per_leg")]
    pub slippage_buffer_per_leg: Decimal,
    /// Multiplier applied to exchange minimums
    #[serde(default = "default_min_size_safety_multiplier")]
    pub min_size_safety_multiplier: Decimal,
    /// Fraction of free balance usable for leg 1
    #[serde(default = "default_balance_buffer")]
    pub balance_buffer: Decimal,
    /// Fraction of available balance recommended as max size on failure
    #[serde(default = "default_recommended_balance_fraction")]
    pub recommended_balance_fraction: Decimal,
    /// Fraction of each leg's received amount carried into the next leg
    #[serde(default = "default_carry_forward_factor")]
    pub carry_forward_factor: Decimal,
    /// Taker fee assumed per leg when recomputing plans
    #[serde(default = "default_estimated_fee_rate")]
    pub estimated_fee_rate: Decimal,
    /// Minimum expected profit (%) for a plan to be executable
    #[serde(default = "default_min_profit_pct")]
    pub min_profit_pct: Decimal,
    /// Per-attempt timeout when the request does not specify one
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseConfig {
    /// Fractional distance from market for aggressive limit prices
    #[serde(default = "default_aggressive_margin")]
    pub aggressive_margin: Decimal,
    #[serde(default = "default_ultra_fast_max_wait_ms")]
    pub ultra_fast_max_wait_ms: u64,
    #[serde(default = "default_hybrid_max_wait_ms")]
    pub hybrid_max_wait_ms: u64,
    /// Cached push prices older than this are not used
    #[serde(default = "default_price_stale_ms")]
    pub price_stale_ms: u64,
    /// How long to wait for a fresh push price before giving up
    #[serde(default = "default_price_wait_ms")]
    pub price_wait_ms: u64,
    /// Poll interval when at least one leg has push position updates
    #[serde(default = "default_push_poll_interval_ms")]
    pub push_poll_interval_ms: u64,
    /// Poll interval when neither leg has push position updates
    #[serde(default = "default_rest_poll_interval_ms")]
    pub rest_poll_interval_ms: u64,
    /// Push position data younger than this is preferred over a REST call
    #[serde(default = "default_push_fresh_ms")]
    pub push_fresh_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_slippage_buffer_per_leg() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

fn default_min_size_safety_multiplier() -> Decimal {
    Decimal::new(25, 1) // 2.5x
}

fn default_balance_buffer() -> Decimal {
    Decimal::new(995, 3) // 0.995
}

fn default_recommended_balance_fraction() -> Decimal {
    Decimal::new(95, 2) // 0.95
}

fn default_carry_forward_factor() -> Decimal {
    Decimal::new(995, 3) // 0.995
}

fn default_estimated_fee_rate() -> Decimal {
    Decimal::new(1, 3) // 0.1% taker
}

fn default_min_profit_pct() -> Decimal {
    Decimal::ZERO
}

fn default_execution_timeout_secs() -> u64 {
    30
}

fn default_aggressive_margin() -> Decimal {
    Decimal::new(5, 4) // 0.05%
}

fn default_ultra_fast_max_wait_ms() -> u64 {
    3000
}

fn default_hybrid_max_wait_ms() -> u64 {
    5000
}

fn default_price_stale_ms() -> u64 {
    2000
}

fn default_price_wait_ms() -> u64 {
    3000
}

fn default_push_poll_interval_ms() -> u64 {
    500
}

fn default_rest_poll_interval_ms() -> u64 {
    1000
}

fn default_push_fresh_ms() -> u64 {
    2000
}

fn default_db_path() -> String {
    "data/positions.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("MLE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let t = &self.triangle;

        anyhow::ensure!(t.max_attempts >= 1, "max_attempts must be at least 1");

        anyhow::ensure!(
            t.slippage_buffer_per_leg >= Decimal::ZERO && t.slippage_buffer_per_leg < Decimal::ONE,
            "slippage_buffer_per_leg must be in [0, 1)"
        );

        anyhow::ensure!(
            t.min_size_safety_multiplier >= Decimal::ONE,
            "min_size_safety_multiplier must be >= 1"
        );

        for (name, value) in [
            ("balance_buffer", t.balance_buffer),
            ("recommended_balance_fraction", t.recommended_balance_fraction),
            ("carry_forward_factor", t.carry_forward_factor),
        ] {
            anyhow::ensure!(
                value > Decimal::ZERO && value <= Decimal::ONE,
                "{} must be between 0 and 1",
                name
            );
        }

        anyhow::ensure!(
            t.estimated_fee_rate >= Decimal::ZERO && t.estimated_fee_rate < Decimal::ONE,
            "estimated_fee_rate must be in [0, 1)"
        );

        let c = &self.close;
        anyhow::ensure!(
            c.aggressive_margin >= Decimal::ZERO && c.aggressive_margin < Decimal::ONE,
            "aggressive_margin must be in [0, 1)"
        );

        anyhow::ensure!(
            c.push_poll_interval_ms > 0 && c.rest_poll_interval_ms > 0,
            "poll intervals must be positive"
        );

        Ok(())
    }
}

impl TriangleConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

impl CloseConfig {
    pub fn ultra_fast_max_wait(&self) -> Duration {
        Duration::from_millis(self.ultra_fast_max_wait_ms)
    }

    pub fn hybrid_max_wait(&self) -> Duration {
        Duration::from_millis(self.hybrid_max_wait_ms)
    }

    pub fn price_stale(&self) -> Duration {
        Duration::from_millis(self.price_stale_ms)
    }

    pub fn price_wait(&self) -> Duration {
        Duration::from_millis(self.price_wait_ms)
    }

    pub fn push_fresh(&self) -> Duration {
        Duration::from_millis(self.push_fresh_ms)
    }

    /// Hybrid poll interval: faster when either leg streams positions.
    pub fn poll_interval(&self, any_push: bool) -> Duration {
        if any_push {
            Duration::from_millis(self.push_poll_interval_ms)
        } else {
            Duration::from_millis(self.rest_poll_interval_ms)
        }
    }
}

impl Default for TriangleConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            slippage_buffer_per_leg: default_slippage_buffer_per_leg(),
            min_size_safety_multiplier: default_min_size_safety_multiplier(),
            balance_buffer: default_balance_buffer(),
            recommended_balance_fraction: default_recommended_balance_fraction(),
            carry_forward_factor: default_carry_forward_factor(),
            estimated_fee_rate: default_estimated_fee_rate(),
            min_profit_pct: default_min_profit_pct(),
            execution_timeout_secs: default_execution_timeout_secs(),
        }
    }
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            aggressive_margin: default_aggressive_margin(),
            ultra_fast_max_wait_ms: default_ultra_fast_max_wait_ms(),
            hybrid_max_wait_ms: default_hybrid_max_wait_ms(),
            price_stale_ms: default_price_stale_ms(),
            price_wait_ms: default_price_wait_ms(),
            push_poll_interval_ms: default_push_poll_interval_ms(),
            rest_poll_interval_ms: default_rest_poll_interval_ms(),
            push_fresh_ms: default_push_fresh_ms(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
