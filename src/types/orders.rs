//! Order-related types.

use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Order type. `LimitMaker` is rejected by the exchange instead of taking
/// liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    LimitMaker,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::LimitMaker => "LIMIT_MAKER",
            OrderType::Market => "MARKET",
        }
    }
}

/// Time in force for LIMIT orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

/// Exchange order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    /// Anything the exchange adds later; tolerated and ignored.
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    /// Terminal statuses: the order will never trade again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Terminal without having fully traded.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// Outbound order request.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: Option<TimeInForce>,
    pub quantity: String,
    pub price: Option<String>,
    pub client_order_id: String,
}

/// One partial execution reported in a create-order response.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFill {
    pub price: String,
    pub qty: String,
    pub commission: String,
    pub commission_asset: String,
}

/// Order state as reported by the REST API (create, query, cancel, open list).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    #[serde(default)]
    pub transact_time: i64,
    pub price: String,
    pub orig_qty: String,
    pub executed_qty: String,
    #[serde(default)]
    pub cummulative_quote_qty: String,
    pub status: OrderStatus,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: Side,
    #[serde(default)]
    pub fills: Vec<OrderFill>,
}

impl OrderResponse {
    pub fn orig_qty_f64(&self) -> f64 {
        self.orig_qty.parse().unwrap_or(0.0)
    }

    pub fn price_f64(&self) -> f64 {
        self.price.parse().unwrap_or(0.0)
    }

    /// Volume-weighted average price across response fills, falling back to
    /// the limit price when the venue omits fill details.
    pub fn avg_fill_price(&self) -> f64 {
        let mut qty = 0.0;
        let mut quote = 0.0;
        for fill in &self.fills {
            let p: f64 = fill.price.parse().unwrap_or(0.0);
            let q: f64 = fill.qty.parse().unwrap_or(0.0);
            qty += q;
            quote += p * q;
        }
        if qty > 0.0 {
            quote / qty
        } else {
            self.price_f64()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_deserializes_from_exchange_strings() {
        let s: OrderStatus = serde_json::from_str("\"FILLED\"").unwrap();
        assert_eq!(s, OrderStatus::Filled);
        let s: OrderStatus = serde_json::from_str("\"PARTIALLY_FILLED\"").unwrap();
        assert_eq!(s, OrderStatus::PartiallyFilled);
        let s: OrderStatus = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(s, OrderStatus::Unknown);
    }

    #[test]
    fn terminal_classification() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Expired.is_dead());
        assert!(!OrderStatus::Filled.is_dead());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn avg_fill_price_weights_partial_fills() {
        let resp: OrderResponse = serde_json::from_value(serde_json::json!({
            "symbol": "BTCUSDT",
            "orderId": 7,
            "clientOrderId": "BUY_1",
            "price": "80000",
            "origQty": "0.0002",
            "executedQty": "0.0002",
            "status": "FILLED",
            "type": "LIMIT_MAKER",
            "side": "BUY",
            "fills": [
                {"price": "80000", "qty": "0.0001", "commission": "0", "commissionAsset": "BTC"},
                {"price": "79990", "qty": "0.0001", "commission": "0", "commissionAsset": "BTC"}
            ]
        }))
        .unwrap();
        assert!((resp.avg_fill_price() - 79995.0).abs() < 1e-9);
    }
}
