//! Payloads read off the user-data and market streams.
//!
//! Field names follow the exchange's single-letter wire schema; anything not
//! listed here is tolerated and ignored.

use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, Side};

/// An `executionReport` event from the user-data stream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionReport {
    /// Event type
    #[serde(rename = "e")]
    pub event: String,
    /// Event time (ms)
    #[serde(rename = "E", default)]
    pub event_time: i64,
    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,
    /// Client order id
    #[serde(rename = "c")]
    pub client_order_id: String,
    /// Original client order id; set on cancels
    #[serde(rename = "C", default)]
    pub orig_client_order_id: String,
    /// Side
    #[serde(rename = "S")]
    pub side: Side,
    /// Current order status
    #[serde(rename = "X")]
    pub status: OrderStatus,
    /// Order price
    #[serde(rename = "p", default)]
    pub price: String,
    /// Last executed price
    #[serde(rename = "L", default)]
    pub last_exec_price: String,
    /// Last executed quantity
    #[serde(rename = "l", default)]
    pub last_exec_qty: String,
    /// Cumulative filled quantity
    #[serde(rename = "z", default)]
    pub cum_qty: String,
    /// Commission amount
    #[serde(rename = "n", default)]
    pub commission: String,
    /// Commission asset
    #[serde(rename = "N", default)]
    pub commission_asset: Option<String>,
    /// Transaction time (ms)
    #[serde(rename = "T", default)]
    pub transact_time: i64,
}

impl ExecutionReport {
    /// Id to resolve against the ledger. Cancel reports carry the canceled
    /// order's id in `C` while `c` holds the cancel request's own id.
    pub fn effective_client_id(&self) -> &str {
        if self.status.is_dead() && !self.orig_client_order_id.is_empty() {
            &self.orig_client_order_id
        } else {
            &self.client_order_id
        }
    }

    pub fn cum_qty_f64(&self) -> f64 {
        self.cum_qty.parse().unwrap_or(0.0)
    }

    pub fn last_exec_price_f64(&self) -> f64 {
        self.last_exec_price.parse().unwrap_or(0.0)
    }
}

/// A `bookTicker` stream update.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BookTickerUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid_price: String,
    #[serde(rename = "a")]
    pub ask_price: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_execution_report() {
        let raw = r#"{
            "e": "executionReport", "E": 1700000000000, "s": "BTCUSDT",
            "c": "BUY_1_1", "C": "", "S": "BUY", "o": "LIMIT_MAKER",
            "X": "FILLED", "p": "80000", "L": "80000", "l": "0.000125",
            "z": "0.000125", "n": "0.0001", "N": "BNB", "T": 1700000000001,
            "i": 42, "w": false, "m": true
        }"#;
        let report: ExecutionReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.event, "executionReport");
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.side, Side::Buy);
        assert_eq!(report.effective_client_id(), "BUY_1_1");
        assert!((report.cum_qty_f64() - 0.000125).abs() < 1e-12);
    }

    #[test]
    fn cancel_reports_resolve_via_original_id() {
        let raw = r#"{
            "e": "executionReport", "s": "BTCUSDT",
            "c": "cancel_req_9", "C": "BUY_1_1", "S": "BUY",
            "X": "CANCELED", "L": "0", "l": "0", "z": "0"
        }"#;
        let report: ExecutionReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.effective_client_id(), "BUY_1_1");
    }

    #[test]
    fn parses_book_ticker() {
        let raw = r#"{"u":400900217,"s":"BTCUSDT","b":"80000.00","B":"31.2","a":"80001.00","A":"40.6"}"#;
        let update: BookTickerUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.bid_price, "80000.00");
    }
}
