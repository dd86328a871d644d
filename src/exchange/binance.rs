//! Signed REST adapter for Binance spot.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::info;

use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::req::HttpClient;
use crate::types::{AccountInfo, ExchangeInfo, Kline, OrderRequest, OrderResponse, SymbolFilters};

pub const MAINNET_API_URL: &str = "https://api.binance.com";
pub const TESTNET_API_URL: &str = "https://testnet.binance.vision";

/// Widest request validity window the exchange accepts (ms).
const RECV_WINDOW: &str = "60000";

/// Safety bias subtracted from the synchronized clock. The exchange rejects
/// timestamps more than 1000 ms ahead of its own clock but accepts anything
/// up to `recvWindow` behind.
const TIMESTAMP_BIAS_MS: i64 = 1000;

type HmacSha256 = Hmac<Sha256>;

/// Binance spot REST client implementing the [`Exchange`] port.
pub struct BinanceSpot {
    http: HttpClient,
    base_url: String,
    api_key: String,
    secret_key: String,
    time_offset: AtomicI64,
}

impl BinanceSpot {
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret_key, MAINNET_API_URL)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            time_offset: AtomicI64::new(0),
        }
    }

    /// Synchronize the local clock against the exchange server time.
    pub async fn sync_time(&self) -> Result<()> {
        let url = format!("{}/api/v3/time", self.base_url);
        let text = self.http.execute(self.http.inner().get(&url)).await?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| Error::JsonParse(e.to_string()))?;
        let server_time = value
            .get("serverTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::JsonParse("missing serverTime".to_string()))?;

        let local = now_millis();
        self.time_offset.store(server_time - local, Ordering::Relaxed);
        info!(
            server_time,
            local_time = local,
            offset_ms = server_time - local,
            "Time synchronized"
        );
        Ok(())
    }

    fn server_time(&self) -> i64 {
        now_millis() + self.time_offset.load(Ordering::Relaxed) - TIMESTAMP_BIAS_MS
    }

    fn sign(&self, query: &str) -> String {
        // HMAC accepts keys of any length; this cannot fail.
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC key of any length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Assemble a signed query string: params + timestamp + recvWindow +
    /// HMAC signature over the encoded query.
    fn signed_query(&self, mut params: Vec<(&str, String)>) -> String {
        params.push(("timestamp", self.server_time().to_string()));
        params.push(("recvWindow", RECV_WINDOW.to_string()));
        let query = encode_query(&params);
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn signed_get(&self, endpoint: &str, params: Vec<(&str, String)>) -> Result<String> {
        self.signed_send(reqwest::Method::GET, endpoint, params).await
    }

    async fn signed_send(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<String> {
        let url = format!("{}{}?{}", self.base_url, endpoint, self.signed_query(params));
        let builder = self
            .http
            .inner()
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key);
        self.http.execute(builder).await
    }

    async fn keyed_send(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<String> {
        let mut url = format!("{}{}", self.base_url, endpoint);
        if !params.is_empty() {
            url = format!("{url}?{}", encode_query(params));
        }
        let builder = self
            .http
            .inner()
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key);
        self.http.execute(builder).await
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::JsonParse(e.to_string()))
}

#[async_trait]
impl Exchange for BinanceSpot {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderResponse> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", req.symbol.clone()),
            ("side", req.side.as_str().to_string()),
            ("type", req.order_type.as_str().to_string()),
            ("newOrderRespType", "FULL".to_string()),
            ("quantity", req.quantity.clone()),
            ("newClientOrderId", req.client_order_id.clone()),
        ];
        if let Some(tif) = req.time_in_force {
            params.push(("timeInForce", tif.as_str().to_string()));
        }
        if let Some(price) = &req.price {
            params.push(("price", price.clone()));
        }

        let text = self
            .signed_send(reqwest::Method::POST, "/api/v3/order", params)
            .await
            .map_err(Error::from_exchange)?;
        parse_json(&text)
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResponse> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let text = self
            .signed_send(reqwest::Method::DELETE, "/api/v3/order", params)
            .await
            .map_err(Error::from_exchange)?;
        parse_json(&text)
    }

    async fn query_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResponse> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let text = self
            .signed_get("/api/v3/order", params)
            .await
            .map_err(Error::from_exchange)?;
        parse_json(&text)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderResponse>> {
        let params = vec![("symbol", symbol.to_string())];
        let text = self.signed_get("/api/v3/openOrders", params).await?;
        parse_json(&text)
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        let params = vec![("omitZeroBalances", "true".to_string())];
        let text = self.signed_get("/api/v3/account", params).await?;
        parse_json(&text)
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let url = format!("{}/api/v3/klines?{}", self.base_url, encode_query(&params));
        let text = self.http.execute(self.http.inner().get(&url)).await?;

        let rows: Vec<Vec<Value>> = parse_json(&text)?;
        Ok(rows.iter().filter_map(|r| Kline::from_row(r)).collect())
    }

    async fn exchange_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let url = format!("{}/api/v3/exchangeInfo?symbol={symbol}", self.base_url);
        let text = self.http.execute(self.http.inner().get(&url)).await?;
        let info: ExchangeInfo = parse_json(&text)?;
        SymbolFilters::from_info(&info, symbol)
    }

    async fn start_user_stream(&self) -> Result<String> {
        let text = self
            .keyed_send(reqwest::Method::POST, "/api/v3/userDataStream", &[])
            .await?;
        let value: Value = parse_json(&text)?;
        value
            .get("listenKey")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::JsonParse("missing listenKey".to_string()))
    }

    async fn keepalive_user_stream(&self, listen_key: &str) -> Result<()> {
        let params = [("listenKey", listen_key.to_string())];
        self.keyed_send(reqwest::Method::PUT, "/api/v3/userDataStream", &params)
            .await?;
        Ok(())
    }

    async fn close_user_stream(&self, listen_key: &str) -> Result<()> {
        let params = [("listenKey", listen_key.to_string())];
        self.keyed_send(reqwest::Method::DELETE, "/api/v3/userDataStream", &params)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hmac_sha256() {
        let client = BinanceSpot::with_base_url("key", "secret", MAINNET_API_URL);
        let sig = client.sign("symbol=BTCUSDT&timestamp=1");
        // Deterministic for a fixed secret and payload.
        assert_eq!(sig, client.sign("symbol=BTCUSDT&timestamp=1"));
        assert_eq!(sig.len(), 64);
        assert_ne!(sig, client.sign("symbol=BTCUSDT&timestamp=2"));
    }

    #[test]
    fn query_encoding_preserves_order() {
        let q = encode_query(&[
            ("symbol", "BTCUSDT".to_string()),
            ("side", "BUY".to_string()),
        ]);
        assert_eq!(q, "symbol=BTCUSDT&side=BUY");
    }
}
