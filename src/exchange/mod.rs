//! Exchange capability: the port the core trades through.
//!
//! The grid core never talks HTTP directly; it holds an `Arc<dyn Exchange>`
//! so tests can substitute the in-memory simulator.

mod binance;
mod sim;

pub use binance::{BinanceSpot, MAINNET_API_URL, TESTNET_API_URL};
pub use sim::SimExchange;

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{AccountInfo, Kline, OrderRequest, OrderResponse, SymbolFilters};

/// Abstract exchange operations required by the grid core.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Submit an order. The response carries the immediate status; a
    /// post-only order that would cross the spread fails with
    /// `Error::PostOnlyReject`.
    async fn place_order(&self, req: OrderRequest) -> Result<OrderResponse>;

    /// Cancel an order by client order id.
    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResponse>;

    /// Fetch the current state of an order by client order id.
    async fn query_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResponse>;

    /// All open orders for a symbol.
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderResponse>>;

    /// Account balances and commission basis points.
    async fn account_info(&self) -> Result<AccountInfo>;

    /// Recent OHLC candles, oldest first.
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;

    /// Trading filters (tick, step, minimum notional) for a symbol.
    async fn exchange_filters(&self, symbol: &str) -> Result<SymbolFilters>;

    /// Open a user-data stream, returning the listen key.
    async fn start_user_stream(&self) -> Result<String>;

    /// Keep a listen key alive.
    async fn keepalive_user_stream(&self, listen_key: &str) -> Result<()>;

    /// Close a listen key.
    async fn close_user_stream(&self, listen_key: &str) -> Result<()>;
}
