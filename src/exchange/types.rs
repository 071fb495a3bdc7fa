//! Normalized exchange types shared by connectors, the triangle orchestrator
//! and the close strategies.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that undoes a fill on this side.
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Parse a side as stored or reported by exchanges ("buy", "BUY", "Sell").
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of an open derivatives position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Order side that reduces a position of this direction.
    pub fn closing_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    /// Direction implied by a signed position size (positive = long).
    pub fn from_signed_size(size: Decimal) -> Option<Self> {
        if size > Decimal::ZERO {
            Some(PositionSide::Long)
        } else if size < Decimal::ZERO {
            Some(PositionSide::Short)
        } else {
            None
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Flags attached to a limit order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitOrderOptions {
    /// Order may only decrease an existing position
    pub reduce_only: bool,
    /// Order must rest on the book (maker) or be rejected
    pub post_only: bool,
}

/// Order status as reported by REST responses and push order updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Parse the many spellings exchanges use ("PARTIALLY_FILLED",
    /// "PartiallyFilled", "closed", "Cancelled", ...).
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "new" | "open" | "created" | "untriggered" => Some(OrderStatus::New),
            "partiallyfilled" | "partial" => Some(OrderStatus::PartiallyFilled),
            "filled" | "closed" => Some(OrderStatus::Filled),
            "canceled" | "cancelled" | "partiallyfilledcanceled" => Some(OrderStatus::Canceled),
            "rejected" => Some(OrderStatus::Rejected),
            "expired" | "expiredinmatch" | "deactivated" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    /// No further fills can happen once an order reaches one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// Single fee charge in a CCXT-style fees array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeEntry {
    pub cost: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Order response as returned by a connector.
///
/// Exchanges disagree on how fills are reported. Some return cumulative
/// execution fields (`cumExecQty`, `cumExecValue`, `cumExecFee`, `avgPrice`),
/// others return CCXT-style `filled` / `average` / `cost` / `fee` / `fees`.
/// Both shapes deserialize into this struct; [`OrderResponse::normalize`]
/// collapses them into an [`OrderFill`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(alias = "id")]
    pub order_id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default, alias = "orderStatus")]
    pub status: Option<String>,

    // Cumulative-execution style
    #[serde(default)]
    pub cum_exec_qty: Option<Decimal>,
    #[serde(default)]
    pub cum_exec_value: Option<Decimal>,
    #[serde(default)]
    pub cum_exec_fee: Option<Decimal>,
    #[serde(default)]
    pub avg_price: Option<Decimal>,
    #[serde(default)]
    pub fee_currency: Option<String>,

    // CCXT style
    #[serde(default)]
    pub filled: Option<Decimal>,
    #[serde(default)]
    pub average: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub cost: Option<Decimal>,
    #[serde(default)]
    pub fee: Option<FeeEntry>,
    #[serde(default)]
    pub fees: Vec<FeeEntry>,
}

/// Exchange-independent view of an order's execution.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_id: String,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub total_fees: Decimal,
    /// Asset the fees were charged in, when the exchange says
    pub fee_currency: Option<String>,
}

impl OrderResponse {
    /// Build a response in cumulative-execution style.
    pub fn cumulative(
        order_id: impl Into<String>,
        symbol: impl Into<String>,
        cum_exec_qty: Decimal,
        avg_price: Decimal,
        cum_exec_fee: Decimal,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            symbol: symbol.into(),
            status: Some("Filled".to_string()),
            cum_exec_qty: Some(cum_exec_qty),
            cum_exec_value: Some(cum_exec_qty * avg_price),
            cum_exec_fee: Some(cum_exec_fee),
            avg_price: Some(avg_price),
            ..Default::default()
        }
    }

    /// Build a response in CCXT style with a fees array.
    pub fn ccxt(
        order_id: impl Into<String>,
        symbol: impl Into<String>,
        filled: Decimal,
        average: Decimal,
        fees: Vec<Decimal>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            symbol: symbol.into(),
            status: Some("closed".to_string()),
            filled: Some(filled),
            average: Some(average),
            cost: Some(filled * average),
            fees: fees
                .into_iter()
                .map(|cost| FeeEntry {
                    cost,
                    currency: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Tag the response's fees with the asset they were charged in.
    pub fn with_fee_currency(mut self, currency: impl Into<String>) -> Self {
        let currency = currency.into();
        for entry in self.fees.iter_mut().chain(self.fee.as_mut()) {
            entry.currency.get_or_insert_with(|| currency.clone());
        }
        self.fee_currency = Some(currency);
        self
    }

    /// Acknowledgement of a resting order with nothing filled yet.
    pub fn accepted(order_id: impl Into<String>, symbol: impl Into<String>, price: Decimal) -> Self {
        Self {
            order_id: order_id.into(),
            symbol: symbol.into(),
            status: Some("NEW".to_string()),
            filled: Some(Decimal::ZERO),
            price: Some(price),
            ..Default::default()
        }
    }

    pub fn order_status(&self) -> Option<OrderStatus> {
        self.status.as_deref().and_then(OrderStatus::parse)
    }

    /// Normalize either response shape into `{order_id, filled_qty, avg_price, total_fees}`.
    pub fn normalize(&self) -> OrderFill {
        if let Some(qty) = self.cum_exec_qty {
            let avg_price = self
                .avg_price
                .filter(|p| *p > Decimal::ZERO)
                .or_else(|| match self.cum_exec_value {
                    Some(value) if qty > Decimal::ZERO => Some(value / qty),
                    _ => None,
                })
                .unwrap_or(Decimal::ZERO);

            return OrderFill {
                order_id: self.order_id.clone(),
                filled_qty: qty,
                avg_price,
                total_fees: self.cum_exec_fee.unwrap_or(Decimal::ZERO),
                fee_currency: self.fee_currency.clone(),
            };
        }

        let filled_qty = self.filled.unwrap_or(Decimal::ZERO);
        let avg_price = self
            .average
            .filter(|p| *p > Decimal::ZERO)
            .or_else(|| match self.cost {
                Some(cost) if filled_qty > Decimal::ZERO => Some(cost / filled_qty),
                _ => None,
            })
            .or(self.price)
            .unwrap_or(Decimal::ZERO);

        let total_fees = if self.fees.is_empty() {
            self.fee.as_ref().map(|f| f.cost).unwrap_or(Decimal::ZERO)
        } else {
            self.fees.iter().map(|f| f.cost).sum()
        };

        let fee_currency = self
            .fees
            .iter()
            .chain(self.fee.as_ref())
            .find_map(|f| f.currency.clone())
            .or_else(|| self.fee_currency.clone());

        OrderFill {
            order_id: self.order_id.clone(),
            filled_qty,
            avg_price,
            total_fees,
            fee_currency,
        }
    }
}

/// Current position on a symbol as reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub symbol: String,
    /// Signed size: positive = long, negative = short
    pub size: Decimal,
    /// Mark, last or average price, whichever the exchange reports
    pub mark_price: Option<Decimal>,
}

/// Balance of one asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

impl AssetBalance {
    pub fn free(amount: Decimal) -> Self {
        Self {
            free: amount,
            used: Decimal::ZERO,
            total: amount,
        }
    }
}

/// Balances keyed by asset name.
pub type Balances = HashMap<String, AssetBalance>;

/// Exchange trading rules for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SymbolLimits {
    /// Minimum order quantity in base units
    pub min_order_qty: Decimal,
    /// Minimum order value in quote units
    pub min_notional: Decimal,
    /// Quantity increment (zero = unrestricted)
    pub qty_step: Decimal,
    /// Price increment (zero = unrestricted)
    pub price_step: Decimal,
}

/// Normalized push order update.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Normalized push position update.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    pub symbol: String,
    /// Signed size: positive = long, negative = short
    pub size: Decimal,
}

/// Normalized push price update.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: Decimal,
}

/// Event delivered on a connector's push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Order(OrderUpdate),
    Position(PositionUpdate),
    Price(PriceUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_cumulative_exec_payload() {
        let json = r#"{
            "orderId": "1321052653536515584",
            "symbol": "BTCUSDT",
            "orderStatus": "Filled",
            "cumExecQty": "0.002",
            "cumExecValue": "100.2",
            "cumExecFee": "0.0601",
            "avgPrice": null
        }"#;
        let response: OrderResponse = serde_json::from_str(json).unwrap();
        let fill = response.normalize();

        assert_eq!(fill.order_id, "1321052653536515584");
        assert_eq!(fill.filled_qty, dec!(0.002));
        assert_eq!(fill.avg_price, dec!(50100));
        assert_eq!(fill.total_fees, dec!(0.0601));
        assert_eq!(fill.fee_currency, None);
        assert_eq!(response.order_status(), Some(OrderStatus::Filled));
    }

    #[test]
    fn test_fee_currency_survives_both_shapes() {
        let fill = OrderResponse::cumulative("1", "ETHBTC", dec!(2), dec!(0.05), dec!(0.0001))
            .with_fee_currency("BTC")
            .normalize();
        assert_eq!(fill.fee_currency.as_deref(), Some("BTC"));

        let json = r#"{"orderId": "2", "cumExecQty": "1", "avgPrice": "10", "cumExecFee": "0.001", "feeCurrency": "ETH"}"#;
        let response: OrderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.normalize().fee_currency.as_deref(), Some("ETH"));

        let response = OrderResponse::ccxt("3", "ETH/USDT", dec!(1), dec!(10), vec![dec!(0.01)])
            .with_fee_currency("USDT");
        assert_eq!(response.fees[0].currency.as_deref(), Some("USDT"));
        assert_eq!(response.normalize().fee_currency.as_deref(), Some("USDT"));
    }

    #[test]
    fn test_normalize_ccxt_payload_sums_fees_array() {
        let json = r#"{
            "id": "abc-1",
            "symbol": "ETH/USDT",
            "status": "closed",
            "filled": 1.5,
            "average": 2000.0,
            "cost": 3000.0,
            "fees": [{"cost": 1.2, "currency": "USDT"}, {"cost": 0.3, "currency": "USDT"}]
        }"#;
        let response: OrderResponse = serde_json::from_str(json).unwrap();
        let fill = response.normalize();

        assert_eq!(fill.order_id, "abc-1");
        assert_eq!(fill.filled_qty, dec!(1.5));
        assert_eq!(fill.avg_price, dec!(2000));
        assert_eq!(fill.total_fees, dec!(1.5));
        assert_eq!(fill.fee_currency.as_deref(), Some("USDT"));
    }

    #[test]
    fn test_normalize_ccxt_falls_back_to_cost_and_single_fee() {
        let response = OrderResponse {
            order_id: "x".to_string(),
            filled: Some(dec!(2)),
            cost: Some(dec!(50)),
            fee: Some(FeeEntry {
                cost: dec!(0.05),
                currency: Some("USDT".to_string()),
            }),
            ..Default::default()
        };
        let fill = response.normalize();

        assert_eq!(fill.avg_price, dec!(25));
        assert_eq!(fill.total_fees, dec!(0.05));
    }

    #[test]
    fn test_missing_fill_normalizes_to_zero() {
        let fill = OrderResponse::accepted("7", "BTCUSDT", dec!(50000)).normalize();
        assert_eq!(fill.filled_qty, Decimal::ZERO);
        assert_eq!(fill.avg_price, dec!(50000));
    }

    #[test]
    fn test_order_status_spellings() {
        assert_eq!(OrderStatus::parse("PARTIALLY_FILLED"), Some(OrderStatus::PartiallyFilled));
        assert_eq!(OrderStatus::parse("Cancelled"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::parse("closed"), Some(OrderStatus::Filled));
        assert_eq!(OrderStatus::parse("bogus"), None);
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
    }

    #[test]
    fn test_position_side_closing() {
        assert_eq!(PositionSide::Long.closing_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_side(), OrderSide::Buy);
        assert_eq!(PositionSide::from_signed_size(dec!(-0.5)), Some(PositionSide::Short));
        assert_eq!(PositionSide::from_signed_size(Decimal::ZERO), None);
        assert_eq!(OrderSide::parse("sell"), Some(OrderSide::Sell));
    }
}
