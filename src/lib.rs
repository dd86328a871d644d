#![deny(unreachable_pub)]

//! Autonomous spot-market grid trading agent.
//!
//! Maintains a ladder of passive buy orders below market, attaches a
//! passive sell at a volatility-derived profit target above each filled
//! buy, and keeps a persistent ledger coherent with the exchange across
//! restarts, dropped stream events, and partial failures.

mod errors;
mod req;

pub mod exchange;
pub mod grid;
pub mod ledger;
pub mod logging;
pub mod types;
pub mod ws;

pub use errors::{Error, HttpErrorKind, Result};
pub use exchange::{BinanceSpot, Exchange, SimExchange, MAINNET_API_URL, TESTNET_API_URL};
pub use grid::{
    AlertClass, AppConfig, CircuitBreaker, EventIngestor, GridController, LogMetricsSink,
    LogNotifier, MetricsSink, Notifier, OrderPipeline, Reconciler, Supervisor,
    VolatilityEstimator, VolatilitySnapshot,
};
pub use ledger::{BalanceCache, LedgerStore, Transaction, TxKind, TxStatus};
pub use logging::{init_logging, targets as log_targets, LogFormat, LogSettings};
pub use types::{
    format_decimal, parse_decimal, AccountInfo, AssetBalance, ExchangeInfo, Kline, OrderFill,
    OrderRequest, OrderResponse, OrderStatus, OrderType, Side, SymbolFilters, Ticker, TimeInForce,
};
pub use ws::{BookTickerUpdate, ExecutionReport, MarketStream, UserStream, MAINNET_WS_URL};
