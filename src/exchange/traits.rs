//! Exchange connector interface and the static capability registry.
//!
//! Every venue is reached through [`ExchangeConnector`], which hides
//! per-exchange quirks behind normalized types:
//! - Order responses normalize via [`OrderResponse::normalize`]
//! - Buy-side broker markups surface as [`ExchangeConnector::buy_cost_premium`]
//! - Push feeds (order/position/price) arrive as [`PushEvent`]s on a broadcast channel

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

use super::types::{
    Balances, LimitOrderOptions, OrderResponse, OrderSide, PositionSnapshot, PushEvent,
    SymbolLimits,
};

/// Trait implemented by every exchange integration.
///
/// Connectors must be safe for concurrent use: callers issue several calls
/// at once (both legs of a close, three price fetches) and do not rely on
/// the connector serializing them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Exchange identifier used for capability lookup (e.g. "bybit").
    fn exchange_name(&self) -> String;

    /// Fractional cost markup applied to market buys (e.g. 0.001 for a 0.1%
    /// broker premium). Zero for most venues.
    fn buy_cost_premium(&self) -> Decimal {
        Decimal::ZERO
    }

    /// Unrestricted market order. Never used on a close path.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResponse>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        options: LimitOrderOptions,
    ) -> Result<OrderResponse>;

    /// Market order flagged reduce-only: it can shrink a position but never
    /// open or grow one.
    async fn place_reduce_only_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResponse>;

    /// Exchange-native "close position" call.
    async fn close_position(&self, symbol: &str) -> Result<OrderResponse>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()>;

    async fn get_position(&self, symbol: &str) -> Result<PositionSnapshot>;

    async fn get_balance(&self) -> Result<Balances>;

    async fn get_symbol_limits(&self, symbol: &str) -> Result<SymbolLimits>;

    async fn get_market_price(&self, symbol: &str) -> Result<Decimal>;

    /// Subscribe to the connector's push channel, if it has one.
    fn subscribe(&self) -> Option<broadcast::Receiver<PushEvent>> {
        None
    }

    /// Submit a limit order over the push (websocket) session instead of REST.
    async fn place_limit_order_push(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        options: LimitOrderOptions,
    ) -> Result<OrderResponse> {
        let _ = (symbol, side, quantity, price, options);
        Err(anyhow!(
            "push order submission not supported by {}",
            self.exchange_name()
        ))
    }
}

/// Static feature flags of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExchangeCapabilities {
    pub push_order_updates: bool,
    pub push_position_updates: bool,
    pub push_price_updates: bool,
    pub limit_orders: bool,
    pub reduce_only: bool,
    pub post_only: bool,
}

impl ExchangeCapabilities {
    const FULL: Self = Self {
        push_order_updates: true,
        push_position_updates: true,
        push_price_updates: true,
        limit_orders: true,
        reduce_only: true,
        post_only: true,
    };

    const REST_ONLY: Self = Self {
        push_order_updates: false,
        push_position_updates: false,
        push_price_updates: false,
        limit_orders: true,
        reduce_only: true,
        post_only: false,
    };
}

/// Known exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Venue {
    Binance,
    Bybit,
    Okx,
    Bitget,
    Gate,
    Hyperliquid,
    Mexc,
    Bingx,
    Backpack,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Venue::Binance => "Binance",
            Venue::Bybit => "Bybit",
            Venue::Okx => "OKX",
            Venue::Bitget => "Bitget",
            Venue::Gate => "Gate",
            Venue::Hyperliquid => "Hyperliquid",
            Venue::Mexc => "MEXC",
            Venue::Bingx => "BingX",
            Venue::Backpack => "Backpack",
        };
        f.write_str(name)
    }
}

impl Venue {
    /// Resolve an exchange name as used by connectors and credentials.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "binance" | "binanceusdm" | "binance-futures" => Some(Venue::Binance),
            "bybit" => Some(Venue::Bybit),
            "okx" | "okex" => Some(Venue::Okx),
            "bitget" => Some(Venue::Bitget),
            "gate" | "gateio" | "gate.io" => Some(Venue::Gate),
            "hyperliquid" => Some(Venue::Hyperliquid),
            "mexc" => Some(Venue::Mexc),
            "bingx" => Some(Venue::Bingx),
            "backpack" => Some(Venue::Backpack),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> ExchangeCapabilities {
        match self {
            Venue::Binance | Venue::Bybit | Venue::Okx | Venue::Hyperliquid => {
                ExchangeCapabilities::FULL
            }
            Venue::Bitget | Venue::Gate => ExchangeCapabilities {
                post_only: true,
                push_price_updates: true,
                push_position_updates: true,
                ..ExchangeCapabilities::REST_ONLY
            },
            Venue::Backpack => ExchangeCapabilities {
                push_price_updates: true,
                post_only: true,
                ..ExchangeCapabilities::REST_ONLY
            },
            Venue::Bingx => ExchangeCapabilities::REST_ONLY,
            Venue::Mexc => ExchangeCapabilities {
                reduce_only: false,
                ..ExchangeCapabilities::REST_ONLY
            },
        }
    }
}

/// Look up the static capabilities of an exchange.
///
/// Unknown exchanges get the conservative all-false default.
pub fn get_capabilities(exchange_name: &str) -> ExchangeCapabilities {
    Venue::from_name(exchange_name)
        .map(|venue| venue.capabilities())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_exchange_gets_all_false() {
        assert_eq!(get_capabilities("some-new-dex"), ExchangeCapabilities::default());
        assert!(!get_capabilities("").push_order_updates);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(get_capabilities("ByBit"), get_capabilities("bybit"));
        assert!(get_capabilities(" BINANCE ").push_order_updates);
    }

    #[test]
    fn test_rest_only_venues() {
        let mexc = get_capabilities("mexc");
        assert!(!mexc.push_order_updates);
        assert!(mexc.limit_orders);
        assert!(!mexc.reduce_only);

        let gate = get_capabilities("gateio");
        assert!(!gate.push_order_updates);
        assert!(gate.push_position_updates);
    }

    #[test]
    fn test_venue_display() {
        assert_eq!(Venue::Okx.to_string(), "OKX");
        assert_eq!(Venue::from_name("gate.io"), Some(Venue::Gate));
    }
}
