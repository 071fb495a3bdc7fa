//! Exchange integrations.
//!
//! Everything above this module talks to venues through the
//! [`ExchangeConnector`] trait and the normalized types in [`types`]:
//! - Order responses in either cumulative or CCXT shape normalize to [`OrderFill`]
//! - Static feature flags per venue come from [`get_capabilities`]
//! - Push feeds decode into [`PushEvent`]s (see [`push`])
//!
//! [`MockExchange`] is a paper connector used by the CLI demos and tests.

pub mod mock;
pub mod push;
mod traits;
mod types;

pub use mock::{ConnectorCall, LimitFillMode, MockExchange, ResponseStyle};
pub use push::{BinanceFuturesDecoder, BybitDecoder, PushDecoder, PushFeed};
#[cfg(test)]
pub use traits::MockExchangeConnector;
pub use traits::{get_capabilities, ExchangeCapabilities, ExchangeConnector, Venue};
pub use types::*;
