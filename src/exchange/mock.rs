//! Mock exchange connector for paper trading and tests.
//!
//! Simulates an exchange account with spot balances and signed derivative
//! positions, fills market orders at the current simulated price, rests or
//! fills limit orders according to [`LimitFillMode`], and can broadcast push
//! events. Every connector call is journaled so callers can assert exactly
//! which order paths were used.

use super::traits::ExchangeConnector;
use super::types::*;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Shape of the order responses produced by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStyle {
    /// `cumExecQty` / `avgPrice` / `cumExecFee`
    Cumulative,
    /// `filled` / `average` / `fees[]`
    Ccxt,
}

/// What happens to a limit order after it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitFillMode {
    /// Acknowledged as NEW, then filled immediately; the fill is visible via
    /// positions and, when push is enabled, an order update event.
    Fill,
    /// Rests on the book and never fills.
    Rest,
}

/// A journaled connector call.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorCall {
    MarketOrder {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
    },
    LimitOrder {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        options: LimitOrderOptions,
        via_push: bool,
    },
    ReduceOnlyOrder {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
    },
    ClosePosition {
        symbol: String,
    },
    CancelOrder {
        order_id: String,
    },
    GetPosition {
        symbol: String,
    },
    GetBalance,
    GetSymbolLimits {
        symbol: String,
    },
    GetMarketPrice {
        symbol: String,
    },
}

impl ConnectorCall {
    /// Whether the call submits an order of any kind.
    pub fn is_order_placement(&self) -> bool {
        matches!(
            self,
            ConnectorCall::MarketOrder { .. }
                | ConnectorCall::LimitOrder { .. }
                | ConnectorCall::ReduceOnlyOrder { .. }
                | ConnectorCall::ClosePosition { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct RestingOrder {
    symbol: String,
    side: OrderSide,
    quantity: Decimal,
    price: Decimal,
}

/// Simulated account state.
#[derive(Debug, Default)]
pub struct MockExchangeState {
    pub balances: Balances,
    /// Signed derivative positions (positive = long)
    pub positions: HashMap<String, Decimal>,
    pub prices: HashMap<String, Decimal>,
    pub limits: HashMap<String, SymbolLimits>,
    /// symbol -> (base asset, quote asset)
    pub markets: HashMap<String, (String, String)>,
    pub total_fees: Decimal,
    pub calls: Vec<ConnectorCall>,
    resting: HashMap<String, RestingOrder>,
    market_failures: HashMap<String, VecDeque<String>>,
    zero_fills: HashMap<String, u32>,
    reduce_only_error: Option<String>,
    close_position_error: Option<String>,
    position_error: Option<String>,
}

/// Mock connector that simulates an exchange account.
pub struct MockExchange {
    name: String,
    state: Mutex<MockExchangeState>,
    order_id_counter: AtomicU64,
    fee_rate: Decimal,
    buy_premium: Decimal,
    response_style: ResponseStyle,
    limit_fill: LimitFillMode,
    push: Option<broadcast::Sender<PushEvent>>,
}

impl MockExchange {
    /// Create a mock exchange with the given name (used for capability lookup).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockExchangeState::default()),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.001),
            buy_premium: Decimal::ZERO,
            response_style: ResponseStyle::Cumulative,
            limit_fill: LimitFillMode::Fill,
            push: None,
        }
    }

    /// Fee charged on every fill, in quote units (default 0.1%).
    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn with_buy_premium(mut self, premium: Decimal) -> Self {
        self.buy_premium = premium;
        self
    }

    pub fn with_response_style(mut self, style: ResponseStyle) -> Self {
        self.response_style = style;
        self
    }

    pub fn with_limit_fill(mut self, mode: LimitFillMode) -> Self {
        self.limit_fill = mode;
        self
    }

    /// Enable the push channel.
    pub fn with_push(mut self) -> Self {
        let (tx, _) = broadcast::channel(1024);
        self.push = Some(tx);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockExchangeState> {
        // A poisoned mock is only possible after a panicking test; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a spot market with its assets, price and trading rules.
    pub fn add_market(
        &self,
        symbol: &str,
        base: &str,
        quote: &str,
        price: Decimal,
        limits: SymbolLimits,
    ) {
        let mut state = self.lock();
        state
            .markets
            .insert(symbol.to_string(), (base.to_string(), quote.to_string()));
        state.prices.insert(symbol.to_string(), price);
        state.limits.insert(symbol.to_string(), limits);
    }

    /// Update a simulated price; broadcasts a price event when push is enabled.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.lock().prices.insert(symbol.to_string(), price);
        self.emit(PushEvent::Price(PriceUpdate {
            symbol: symbol.to_string(),
            price,
        }));
    }

    pub fn set_balance(&self, asset: &str, free: Decimal) {
        self.lock()
            .balances
            .insert(asset.to_string(), AssetBalance::free(free));
    }

    /// Set a signed derivative position (positive = long).
    pub fn set_position(&self, symbol: &str, size: Decimal) {
        self.lock().positions.insert(symbol.to_string(), size);
    }

    /// Make the next `times` market orders on `symbol` fail with `message`.
    pub fn fail_market_orders(&self, symbol: &str, times: usize, message: &str) {
        let mut state = self.lock();
        let queue = state.market_failures.entry(symbol.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(message.to_string());
        }
    }

    /// Make the next `times` market orders on `symbol` report a zero fill.
    pub fn zero_fill_market_orders(&self, symbol: &str, times: u32) {
        *self.lock().zero_fills.entry(symbol.to_string()).or_default() += times;
    }

    pub fn fail_reduce_only(&self, message: &str) {
        self.lock().reduce_only_error = Some(message.to_string());
    }

    pub fn fail_close_position(&self, message: &str) {
        self.lock().close_position_error = Some(message.to_string());
    }

    pub fn fail_get_position(&self, message: &str) {
        self.lock().position_error = Some(message.to_string());
    }

    pub fn position(&self, symbol: &str) -> Decimal {
        self.lock()
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn balance(&self, asset: &str) -> Decimal {
        self.lock()
            .balances
            .get(asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO)
    }

    /// Snapshot of the call journal.
    pub fn calls(&self) -> Vec<ConnectorCall> {
        self.lock().calls.clone()
    }

    /// Number of unrestricted market orders placed.
    pub fn market_order_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ConnectorCall::MarketOrder { .. }))
            .count()
    }

    pub fn order_placement_count(&self) -> usize {
        self.calls().iter().filter(|c| c.is_order_placement()).count()
    }

    pub fn open_order_count(&self) -> usize {
        self.lock().resting.len()
    }

    fn next_order_id(&self) -> String {
        format!(
            "{}-{}",
            self.name,
            self.order_id_counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn emit(&self, event: PushEvent) {
        if let Some(tx) = &self.push {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }

    /// Fees are always charged in the market's quote asset.
    fn respond(
        &self,
        state: &MockExchangeState,
        order_id: String,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> OrderResponse {
        let response = match self.response_style {
            ResponseStyle::Cumulative => OrderResponse::cumulative(order_id, symbol, qty, price, fee),
            ResponseStyle::Ccxt => OrderResponse::ccxt(order_id, symbol, qty, price, vec![fee]),
        };
        match state.markets.get(symbol) {
            Some((_, quote)) => response.with_fee_currency(quote.clone()),
            None => response,
        }
    }

    /// Apply a fill to positions and balances; returns the fee charged.
    fn apply_fill(
        &self,
        state: &mut MockExchangeState,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Decimal {
        let notional = quantity * price;
        let fee = notional * self.fee_rate;

        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        *state.positions.entry(symbol.to_string()).or_default() += signed;

        if let Some((base, quote)) = state.markets.get(symbol).cloned() {
            let premium = if side == OrderSide::Buy {
                notional * self.buy_premium
            } else {
                Decimal::ZERO
            };
            let (base_delta, quote_delta) = match side {
                OrderSide::Buy => (quantity, -(notional + premium + fee)),
                OrderSide::Sell => (-quantity, notional - fee),
            };
            for (asset, delta) in [(base, base_delta), (quote, quote_delta)] {
                let balance = state.balances.entry(asset).or_default();
                balance.free += delta;
                balance.total += delta;
            }
        }

        state.total_fees += fee;
        fee
    }

    fn price_of(state: &MockExchangeState, symbol: &str) -> Result<Decimal> {
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no price for symbol {}", symbol))
    }

    fn submit_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        options: LimitOrderOptions,
        via_push: bool,
    ) -> Result<OrderResponse> {
        let order_id = self.next_order_id();
        let mut events = Vec::new();

        {
            let mut state = self.lock();
            state.calls.push(ConnectorCall::LimitOrder {
                symbol: symbol.to_string(),
                side,
                quantity,
                price,
                options,
                via_push,
            });

            let position = state.positions.get(symbol).copied().unwrap_or(Decimal::ZERO);
            let reduces = match side {
                OrderSide::Buy => position < Decimal::ZERO,
                OrderSide::Sell => position > Decimal::ZERO,
            };
            if options.reduce_only && !reduces {
                bail!("ReduceOnly order is rejected: position is zero or on the same side");
            }

            match self.limit_fill {
                LimitFillMode::Rest => {
                    state.resting.insert(
                        order_id.clone(),
                        RestingOrder {
                            symbol: symbol.to_string(),
                            side,
                            quantity,
                            price,
                        },
                    );
                }
                LimitFillMode::Fill => {
                    let fill_qty = if options.reduce_only {
                        quantity.min(position.abs())
                    } else {
                        quantity
                    };
                    self.apply_fill(&mut state, symbol, side, fill_qty, price);
                    let size = state.positions.get(symbol).copied().unwrap_or(Decimal::ZERO);
                    events.push(PushEvent::Order(OrderUpdate {
                        order_id: order_id.clone(),
                        symbol: symbol.to_string(),
                        status: OrderStatus::Filled,
                        filled_qty: fill_qty,
                        avg_price: Some(price),
                    }));
                    events.push(PushEvent::Position(PositionUpdate {
                        symbol: symbol.to_string(),
                        size,
                    }));
                }
            }
        }

        debug!(exchange = %self.name, %symbol, %order_id, ?side, %quantity, %price, via_push, "Mock limit order accepted");
        for event in events {
            self.emit(event);
        }

        Ok(OrderResponse::accepted(order_id, symbol, price))
    }
}

#[async_trait]
impl ExchangeConnector for MockExchange {
    fn exchange_name(&self) -> String {
        self.name.clone()
    }

    fn buy_cost_premium(&self) -> Decimal {
        self.buy_premium
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResponse> {
        let mut state = self.lock();
        state.calls.push(ConnectorCall::MarketOrder {
            symbol: symbol.to_string(),
            side,
            quantity,
        });

        if let Some(message) = state
            .market_failures
            .get_mut(symbol)
            .and_then(|queue| queue.pop_front())
        {
            bail!(message);
        }

        let order_id = self.next_order_id();

        if let Some(remaining) = state.zero_fills.get_mut(symbol).filter(|n| **n > 0) {
            *remaining -= 1;
            return Ok(self.respond(&state, order_id, symbol, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO));
        }

        let price = Self::price_of(&state, symbol)?;
        let fee = self.apply_fill(&mut state, symbol, side, quantity, price);

        info!(
            exchange = %self.name,
            %order_id,
            %symbol,
            ?side,
            %quantity,
            %price,
            %fee,
            "Mock market order executed"
        );

        Ok(self.respond(&state, order_id, symbol, quantity, price, fee))
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        options: LimitOrderOptions,
    ) -> Result<OrderResponse> {
        self.submit_limit(symbol, side, quantity, price, options, false)
    }

    async fn place_limit_order_push(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        options: LimitOrderOptions,
    ) -> Result<OrderResponse> {
        if self.push.is_none() {
            bail!("push order submission not supported by {}", self.name);
        }
        self.submit_limit(symbol, side, quantity, price, options, true)
    }

    async fn place_reduce_only_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResponse> {
        let (response, size) = {
            let mut state = self.lock();
            state.calls.push(ConnectorCall::ReduceOnlyOrder {
                symbol: symbol.to_string(),
                side,
                quantity,
            });

            if let Some(message) = state.reduce_only_error.clone() {
                bail!(message);
            }

            let position = state.positions.get(symbol).copied().unwrap_or(Decimal::ZERO);
            let reduces = match side {
                OrderSide::Buy => position < Decimal::ZERO,
                OrderSide::Sell => position > Decimal::ZERO,
            };
            if !reduces {
                bail!("ReduceOnly Order is rejected: position is zero");
            }

            let fill_qty = quantity.min(position.abs());
            let price = Self::price_of(&state, symbol)?;
            let fee = self.apply_fill(&mut state, symbol, side, fill_qty, price);
            let size = state.positions.get(symbol).copied().unwrap_or(Decimal::ZERO);
            (
                self.respond(&state, self.next_order_id(), symbol, fill_qty, price, fee),
                size,
            )
        };

        self.emit(PushEvent::Position(PositionUpdate {
            symbol: symbol.to_string(),
            size,
        }));
        Ok(response)
    }

    async fn close_position(&self, symbol: &str) -> Result<OrderResponse> {
        let response = {
            let mut state = self.lock();
            state.calls.push(ConnectorCall::ClosePosition {
                symbol: symbol.to_string(),
            });

            if let Some(message) = state.close_position_error.clone() {
                bail!(message);
            }

            let position = state.positions.get(symbol).copied().unwrap_or(Decimal::ZERO);
            let side = match PositionSide::from_signed_size(position) {
                Some(side) => side.closing_side(),
                None => bail!("no position to close for {}", symbol),
            };
            let price = Self::price_of(&state, symbol)?;
            let fee = self.apply_fill(&mut state, symbol, side, position.abs(), price);
            self.respond(&state, self.next_order_id(), symbol, position.abs(), price, fee)
        };

        self.emit(PushEvent::Position(PositionUpdate {
            symbol: symbol.to_string(),
            size: Decimal::ZERO,
        }));
        Ok(response)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()> {
        let removed = {
            let mut state = self.lock();
            state.calls.push(ConnectorCall::CancelOrder {
                order_id: order_id.to_string(),
            });
            state.resting.remove(order_id)
        };

        match removed {
            Some(order) => {
                debug!(exchange = %self.name, %order_id, %symbol, side = ?order.side, quantity = %order.quantity, price = %order.price, "Mock order cancelled");
                self.emit(PushEvent::Order(OrderUpdate {
                    order_id: order_id.to_string(),
                    symbol: order.symbol,
                    status: OrderStatus::Canceled,
                    filled_qty: Decimal::ZERO,
                    avg_price: None,
                }));
                Ok(())
            }
            None => Err(anyhow!("Unknown order sent: {} ({})", order_id, symbol)),
        }
    }

    async fn get_position(&self, symbol: &str) -> Result<PositionSnapshot> {
        let mut state = self.lock();
        state.calls.push(ConnectorCall::GetPosition {
            symbol: symbol.to_string(),
        });
        if let Some(message) = state.position_error.clone() {
            bail!(message);
        }
        Ok(PositionSnapshot {
            symbol: symbol.to_string(),
            size: state.positions.get(symbol).copied().unwrap_or(Decimal::ZERO),
            mark_price: state.prices.get(symbol).copied(),
        })
    }

    async fn get_balance(&self) -> Result<Balances> {
        let mut state = self.lock();
        state.calls.push(ConnectorCall::GetBalance);
        Ok(state.balances.clone())
    }

    async fn get_symbol_limits(&self, symbol: &str) -> Result<SymbolLimits> {
        let mut state = self.lock();
        state.calls.push(ConnectorCall::GetSymbolLimits {
            symbol: symbol.to_string(),
        });
        Ok(state.limits.get(symbol).copied().unwrap_or_default())
    }

    async fn get_market_price(&self, symbol: &str) -> Result<Decimal> {
        let mut state = self.lock();
        state.calls.push(ConnectorCall::GetMarketPrice {
            symbol: symbol.to_string(),
        });
        Self::price_of(&state, symbol)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<PushEvent>> {
        self.push.as_ref().map(|tx| tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_limits() -> SymbolLimits {
        SymbolLimits {
            min_order_qty: dec!(0.0001),
            min_notional: dec!(5),
            qty_step: dec!(0.0001),
            price_step: dec!(0.1),
        }
    }

    fn spot_exchange() -> MockExchange {
        let exchange = MockExchange::new("bybit");
        exchange.add_market("BTCUSDT", "BTC", "USDT", dec!(50000), btc_limits());
        exchange.set_balance("USDT", dec!(10000));
        exchange
    }

    #[tokio::test]
    async fn test_market_buy_moves_balances() {
        let exchange = spot_exchange();

        let response = exchange
            .place_market_order("BTCUSDT", OrderSide::Buy, dec!(0.1))
            .await
            .unwrap();
        let fill = response.normalize();

        assert_eq!(fill.filled_qty, dec!(0.1));
        assert_eq!(fill.avg_price, dec!(50000));
        // 0.1 * 50000 * 0.001
        assert_eq!(fill.total_fees, dec!(5));
        assert_eq!(fill.fee_currency.as_deref(), Some("USDT"));
        assert_eq!(exchange.balance("BTC"), dec!(0.1));
        assert_eq!(exchange.balance("USDT"), dec!(4995));
        assert_eq!(exchange.position("BTCUSDT"), dec!(0.1));
    }

    #[tokio::test]
    async fn test_ccxt_response_style() {
        let exchange = MockExchange::new("mexc").with_response_style(ResponseStyle::Ccxt);
        exchange.add_market("BTCUSDT", "BTC", "USDT", dec!(50000), btc_limits());

        let response = exchange
            .place_market_order("BTCUSDT", OrderSide::Sell, dec!(0.2))
            .await
            .unwrap();

        assert!(response.cum_exec_qty.is_none());
        assert_eq!(response.normalize().filled_qty, dec!(0.2));
        assert_eq!(response.normalize().total_fees, dec!(10));
        assert_eq!(response.normalize().fee_currency.as_deref(), Some("USDT"));
    }

    #[tokio::test]
    async fn test_scripted_market_failures_are_consumed_in_order() {
        let exchange = spot_exchange();
        exchange.fail_market_orders("BTCUSDT", 2, "Insufficient liquidity");

        assert!(exchange
            .place_market_order("BTCUSDT", OrderSide::Buy, dec!(0.1))
            .await
            .is_err());
        assert!(exchange
            .place_market_order("BTCUSDT", OrderSide::Buy, dec!(0.1))
            .await
            .is_err());
        assert!(exchange
            .place_market_order("BTCUSDT", OrderSide::Buy, dec!(0.1))
            .await
            .is_ok());
        assert_eq!(exchange.market_order_count(), 3);
    }

    #[tokio::test]
    async fn test_reduce_only_rejected_when_flat() {
        let exchange = spot_exchange();

        let err = exchange
            .place_reduce_only_order("BTCUSDT", OrderSide::Sell, dec!(1))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("position is zero"));
        assert_eq!(exchange.position("BTCUSDT"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reduce_only_caps_at_position_size() {
        let exchange = spot_exchange();
        exchange.set_position("BTCUSDT", dec!(-0.3));

        let response = exchange
            .place_reduce_only_order("BTCUSDT", OrderSide::Buy, dec!(1))
            .await
            .unwrap();

        assert_eq!(response.normalize().filled_qty, dec!(0.3));
        assert_eq!(exchange.position("BTCUSDT"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_resting_limit_order_can_be_cancelled() {
        let exchange = spot_exchange().with_limit_fill(LimitFillMode::Rest);
        exchange.set_position("BTCUSDT", dec!(0.5));

        let response = exchange
            .place_limit_order(
                "BTCUSDT",
                OrderSide::Sell,
                dec!(0.5),
                dec!(49990),
                LimitOrderOptions {
                    reduce_only: true,
                    post_only: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(exchange.open_order_count(), 1);
        assert_eq!(exchange.position("BTCUSDT"), dec!(0.5));

        exchange
            .cancel_order(&response.order_id, "BTCUSDT")
            .await
            .unwrap();
        assert_eq!(exchange.open_order_count(), 0);
        assert!(exchange
            .cancel_order(&response.order_id, "BTCUSDT")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_filled_limit_order_emits_push_events() {
        let exchange = spot_exchange().with_push();
        exchange.set_position("BTCUSDT", dec!(0.5));
        let mut rx = exchange.subscribe().unwrap();

        let response = exchange
            .place_limit_order_push(
                "BTCUSDT",
                OrderSide::Sell,
                dec!(0.5),
                dec!(49990),
                LimitOrderOptions::default(),
            )
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            PushEvent::Order(update) => {
                assert_eq!(update.order_id, response.order_id);
                assert_eq!(update.status, OrderStatus::Filled);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(exchange.position("BTCUSDT"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_close_position_without_position_errors() {
        let exchange = spot_exchange();
        let err = exchange.close_position("BTCUSDT").await.unwrap_err();
        assert!(err.to_string().contains("no position"));
    }
}
