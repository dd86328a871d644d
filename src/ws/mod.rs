//! WebSocket streams: user-data events and top-of-book market data.

mod market_stream;
mod message_types;
mod user_stream;

pub use market_stream::MarketStream;
pub use message_types::{BookTickerUpdate, ExecutionReport};
pub use user_stream::UserStream;

pub const MAINNET_WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// Capacity of the bounded execution-report channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 100;
