//! Push (websocket) feeds: payload decoders and the connection pump.
//!
//! Decoders turn venue-specific frames into normalized [`PushEvent`]s.
//! [`PushFeed`] owns a websocket connection and republishes decoded events
//! on a broadcast channel, which is what connectors hand out from
//! `subscribe()`.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::{OrderStatus, OrderUpdate, PositionUpdate, PriceUpdate, PushEvent};

pub const BINANCE_FUTURES_WS_URL: &str = "wss://fstream.binance.com";
pub const BYBIT_LINEAR_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

/// Converts one text frame into zero or more normalized events.
pub trait PushDecoder: Send + Sync {
    fn decode(&self, text: &str) -> Vec<PushEvent>;
}

fn parse_decimal(value: &str) -> Option<Decimal> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

// ---------------------------------------------------------------------------
// Binance USD-M futures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum BinanceFrame {
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate {
        #[serde(rename = "o")]
        order: BinanceOrder,
    },
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate {
        #[serde(rename = "a")]
        account: BinanceAccount,
    },
    #[serde(rename = "markPriceUpdate")]
    MarkPrice {
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "p")]
        mark_price: String,
    },
}

#[derive(Debug, Deserialize)]
struct BinanceOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "z")]
    filled_qty: String,
    #[serde(rename = "ap", default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct BinanceAccount {
    #[serde(rename = "P", default)]
    positions: Vec<BinancePosition>,
}

#[derive(Debug, Deserialize)]
struct BinancePosition {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa")]
    position_amount: String,
}

/// Decoder for Binance futures user-data and mark-price streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinanceFuturesDecoder;

impl BinanceFuturesDecoder {
    fn decode_frame(&self, frame: BinanceFrame) -> Vec<PushEvent> {
        match frame {
            BinanceFrame::OrderTradeUpdate { order } => {
                let Some(status) = OrderStatus::parse(&order.status) else {
                    debug!(status = %order.status, "Ignoring unknown Binance order status");
                    return vec![];
                };
                vec![PushEvent::Order(OrderUpdate {
                    order_id: order.order_id.to_string(),
                    symbol: order.symbol,
                    status,
                    filled_qty: parse_decimal(&order.filled_qty).unwrap_or(Decimal::ZERO),
                    avg_price: parse_decimal(&order.avg_price).filter(|p| *p > Decimal::ZERO),
                })]
            }
            BinanceFrame::AccountUpdate { account } => account
                .positions
                .into_iter()
                .filter_map(|p| {
                    parse_decimal(&p.position_amount).map(|size| {
                        PushEvent::Position(PositionUpdate {
                            symbol: p.symbol,
                            size,
                        })
                    })
                })
                .collect(),
            BinanceFrame::MarkPrice { symbol, mark_price } => parse_decimal(&mark_price)
                .map(|price| vec![PushEvent::Price(PriceUpdate { symbol, price })])
                .unwrap_or_default(),
        }
    }
}

impl PushDecoder for BinanceFuturesDecoder {
    fn decode(&self, text: &str) -> Vec<PushEvent> {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return vec![];
        };

        // Combined streams wrap the payload as {"stream": ..., "data": ...}
        let payload = match value {
            Value::Object(mut map) if map.contains_key("stream") => {
                map.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };

        let frames = match payload {
            Value::Array(items) => items,
            single => vec![single],
        };

        frames
            .into_iter()
            .filter_map(|frame| serde_json::from_value::<BinanceFrame>(frame).ok())
            .flat_map(|frame| self.decode_frame(frame))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Bybit v5
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BybitFrame {
    topic: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrder {
    order_id: String,
    symbol: String,
    order_status: String,
    #[serde(default)]
    cum_exec_qty: String,
    #[serde(default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitPosition {
    symbol: String,
    #[serde(default)]
    side: String,
    size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    symbol: String,
    #[serde(default)]
    last_price: Option<String>,
    #[serde(default)]
    mark_price: Option<String>,
}

/// Decoder for Bybit v5 private (order, position) and public (tickers) topics.
#[derive(Debug, Default, Clone, Copy)]
pub struct BybitDecoder;

impl BybitDecoder {
    fn items<T: for<'de> Deserialize<'de>>(data: Value) -> Vec<T> {
        let values = match data {
            Value::Array(items) => items,
            single => vec![single],
        };
        values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }
}

impl PushDecoder for BybitDecoder {
    fn decode(&self, text: &str) -> Vec<PushEvent> {
        // Subscription acks and pongs have no topic
        let Ok(frame) = serde_json::from_str::<BybitFrame>(text) else {
            return vec![];
        };

        if frame.topic == "order" || frame.topic.starts_with("order.") {
            Self::items::<BybitOrder>(frame.data)
                .into_iter()
                .filter_map(|o| {
                    let status = OrderStatus::parse(&o.order_status)?;
                    Some(PushEvent::Order(OrderUpdate {
                        order_id: o.order_id,
                        symbol: o.symbol,
                        status,
                        filled_qty: parse_decimal(&o.cum_exec_qty).unwrap_or(Decimal::ZERO),
                        avg_price: parse_decimal(&o.avg_price).filter(|p| *p > Decimal::ZERO),
                    }))
                })
                .collect()
        } else if frame.topic == "position" || frame.topic.starts_with("position.") {
            Self::items::<BybitPosition>(frame.data)
                .into_iter()
                .filter_map(|p| {
                    let size = parse_decimal(&p.size)?;
                    let signed = if p.side.eq_ignore_ascii_case("sell") {
                        -size
                    } else {
                        size
                    };
                    Some(PushEvent::Position(PositionUpdate {
                        symbol: p.symbol,
                        size: signed,
                    }))
                })
                .collect()
        } else if frame.topic.starts_with("tickers.") {
            // Deltas may omit prices that did not change
            Self::items::<BybitTicker>(frame.data)
                .into_iter()
                .filter_map(|t| {
                    let price = t
                        .mark_price
                        .as_deref()
                        .and_then(parse_decimal)
                        .or_else(|| t.last_price.as_deref().and_then(parse_decimal))?;
                    Some(PushEvent::Price(PriceUpdate {
                        symbol: t.symbol,
                        price,
                    }))
                })
                .collect()
        } else {
            vec![]
        }
    }
}

// ---------------------------------------------------------------------------
// Connection pump
// ---------------------------------------------------------------------------

/// Websocket connection that republishes decoded events on a broadcast channel.
pub struct PushFeed {
    url: String,
    subscribe_message: Option<String>,
    decoder: Arc<dyn PushDecoder>,
    tx: broadcast::Sender<PushEvent>,
}

impl PushFeed {
    pub fn new(url: impl Into<String>, decoder: Arc<dyn PushDecoder>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            url: url.into(),
            subscribe_message: None,
            decoder,
            tx,
        }
    }

    /// Binance futures mark-price stream for the given symbols.
    pub fn binance_mark_prices(symbols: &[String]) -> Self {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@markPrice@1s", s.to_lowercase()))
            .collect();
        let url = format!("{}/stream?streams={}", BINANCE_FUTURES_WS_URL, streams.join("/"));
        Self::new(url, Arc::new(BinanceFuturesDecoder))
    }

    /// Bybit linear tickers for the given symbols.
    pub fn bybit_tickers(symbols: &[String]) -> Self {
        let args: Vec<String> = symbols.iter().map(|s| format!("tickers.{}", s)).collect();
        let message = serde_json::json!({ "op": "subscribe", "args": args }).to_string();
        Self::new(BYBIT_LINEAR_WS_URL, Arc::new(BybitDecoder)).with_subscribe_message(message)
    }

    /// Text frame sent right after the connection opens.
    pub fn with_subscribe_message(mut self, message: impl Into<String>) -> Self {
        self.subscribe_message = Some(message.into());
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }

    /// Decode one frame and broadcast the resulting events.
    ///
    /// Returns the number of events decoded.
    pub fn dispatch(&self, text: &str) -> usize {
        let events = self.decoder.decode(text);
        let count = events.len();
        for event in events {
            // Lagging or absent receivers are not our concern here
            let _ = self.tx.send(event);
        }
        count
    }

    /// Connect and spawn the read loop. The task ends when the server closes
    /// the connection or an error occurs.
    pub async fn connect(self: Arc<Self>) -> Result<JoinHandle<()>> {
        info!("Connecting to WebSocket: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .context("Failed to connect to WebSocket")?;

        let (mut write, mut read) = ws_stream.split();

        if let Some(message) = &self.subscribe_message {
            write
                .send(Message::Text(message.clone().into()))
                .await
                .context("Failed to send subscription")?;
        }

        let feed = self.clone();
        let handle = tokio::spawn(async move {
            // Keep the write half alive so the connection stays open
            let _write = write;
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        feed.dispatch(text.as_str());
                    }
                    Ok(Message::Ping(_)) => {
                        debug!("Received ping");
                    }
                    Ok(Message::Close(_)) => {
                        info!("WebSocket closed by server");
                        return;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        return;
                    }
                    _ => {}
                }
            }
            warn!(url = %feed.url, "WebSocket stream ended");
        });

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_binance_order_trade_update() {
        let frame = r#"{"e":"ORDER_TRADE_UPDATE","E":1568879465651,"T":1568879465650,
            "o":{"s":"BTCUSDT","c":"x","S":"SELL","o":"LIMIT","q":"0.001","p":"50000",
                 "ap":"50000.5","X":"FILLED","i":8886774,"z":"0.001"}}"#;

        let events = BinanceFuturesDecoder.decode(frame);
        assert_eq!(
            events,
            vec![PushEvent::Order(OrderUpdate {
                order_id: "8886774".to_string(),
                symbol: "BTCUSDT".to_string(),
                status: OrderStatus::Filled,
                filled_qty: dec!(0.001),
                avg_price: Some(dec!(50000.5)),
            })]
        );
    }

    #[test]
    fn test_binance_account_update_positions() {
        let frame = r#"{"e":"ACCOUNT_UPDATE","E":1,"a":{"m":"ORDER","B":[],
            "P":[{"s":"BTCUSDT","pa":"-0.25","ep":"50000","up":"0"},
                 {"s":"ETHUSDT","pa":"0","ep":"0","up":"0"}]}}"#;

        let events = BinanceFuturesDecoder.decode(frame);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            PushEvent::Position(PositionUpdate {
                symbol: "BTCUSDT".to_string(),
                size: dec!(-0.25),
            })
        );
    }

    #[test]
    fn test_binance_combined_mark_price() {
        let frame = r#"{"stream":"btcusdt@markPrice@1s",
            "data":{"e":"markPriceUpdate","E":1,"s":"BTCUSDT","p":"50123.40","r":"0.0001","T":2}}"#;

        let events = BinanceFuturesDecoder.decode(frame);
        assert_eq!(
            events,
            vec![PushEvent::Price(PriceUpdate {
                symbol: "BTCUSDT".to_string(),
                price: dec!(50123.40),
            })]
        );
    }

    #[test]
    fn test_binance_ignores_unknown_frames() {
        assert!(BinanceFuturesDecoder.decode(r#"{"e":"listenKeyExpired"}"#).is_empty());
        assert!(BinanceFuturesDecoder.decode("not json").is_empty());
    }

    #[test]
    fn test_bybit_position_side_sign() {
        let frame = r#"{"topic":"position","data":[
            {"symbol":"ETHUSDT","side":"Sell","size":"1.5","markPrice":"2000"},
            {"symbol":"BTCUSDT","side":"","size":"0"}]}"#;

        let events = BybitDecoder.decode(frame);
        assert_eq!(
            events,
            vec![
                PushEvent::Position(PositionUpdate {
                    symbol: "ETHUSDT".to_string(),
                    size: dec!(-1.5),
                }),
                PushEvent::Position(PositionUpdate {
                    symbol: "BTCUSDT".to_string(),
                    size: Decimal::ZERO,
                }),
            ]
        );
    }

    #[test]
    fn test_bybit_order_with_empty_avg_price() {
        let frame = r#"{"topic":"order","data":[{"orderId":"abc","symbol":"BTCUSDT",
            "orderStatus":"New","cumExecQty":"0","avgPrice":""}]}"#;

        match BybitDecoder.decode(frame).as_slice() {
            [PushEvent::Order(update)] => {
                assert_eq!(update.status, OrderStatus::New);
                assert_eq!(update.avg_price, None);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_bybit_ticker_delta_without_price_is_skipped() {
        let frame = r#"{"topic":"tickers.BTCUSDT","type":"delta","data":{"symbol":"BTCUSDT","volume24h":"1"}}"#;
        assert!(BybitDecoder.decode(frame).is_empty());

        let frame = r#"{"topic":"tickers.BTCUSDT","type":"snapshot","data":{"symbol":"BTCUSDT","lastPrice":"50000"}}"#;
        assert_eq!(BybitDecoder.decode(frame).len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_broadcasts_decoded_events() {
        let feed = PushFeed::bybit_tickers(&["BTCUSDT".to_string()]);
        let mut rx = feed.subscribe();

        let count = feed.dispatch(
            r#"{"topic":"tickers.BTCUSDT","data":{"symbol":"BTCUSDT","markPrice":"50001"}}"#,
        );

        assert_eq!(count, 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            PushEvent::Price(PriceUpdate {
                symbol: "BTCUSDT".to_string(),
                price: dec!(50001),
            })
        );
        // Acks decode to nothing
        assert_eq!(feed.dispatch(r#"{"success":true,"op":"subscribe"}"#), 0);
    }
}
