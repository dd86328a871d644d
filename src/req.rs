use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::errors::{Error, Result};

/// HTTP status codes that indicate transient server errors (retryable)
const RETRYABLE_STATUS_CODES: &[u16] = &[502, 503, 504];

/// Maximum number of retry attempts for transient errors
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds (doubles with each retry)
const INITIAL_BACKOFF_MS: u64 = 100;

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-minute request-weight budget granted by the exchange.
const WEIGHT_LIMIT_1M: i64 = 6000;

#[derive(Deserialize, Debug)]
struct ErrorData {
    code: i32,
    msg: String,
}

/// Thin wrapper over reqwest with transient-error retry and weight monitoring.
#[derive(Debug, Clone)]
pub(crate) struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub(crate) fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub(crate) fn inner(&self) -> &Client {
        &self.client
    }

    /// Execute a request builder with automatic retry for transient server
    /// errors (502, 503, 504).
    ///
    /// Uses exponential backoff: 100ms, 200ms, 400ms between retries.
    pub(crate) async fn execute(&self, builder: RequestBuilder) -> Result<String> {
        for attempt in 0..=MAX_RETRIES {
            let request = builder
                .try_clone()
                .ok_or_else(|| Error::GenericRequest("request is not cloneable".to_string()))?
                .build()
                .map_err(|e| Error::GenericRequest(e.to_string()))?;
            let url_path = request.url().path().to_string();

            let response = self
                .client
                .execute(request)
                .await
                .map_err(|e| Error::GenericRequest(e.to_string()))?;

            observe_weight(&response);

            let status = response.status().as_u16();
            if RETRYABLE_STATUS_CODES.contains(&status) && attempt < MAX_RETRIES {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    status = status,
                    attempt = attempt + 1,
                    max_attempts = MAX_RETRIES + 1,
                    backoff_ms = backoff.as_millis(),
                    url = %url_path,
                    "Retryable HTTP error, backing off"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            return parse_response(response).await;
        }

        Err(Error::GenericRequest(format!(
            "Max retries ({MAX_RETRIES}) exceeded"
        )))
    }
}

/// Surface the exchange's per-minute request-weight header so approaching
/// rate-limit exhaustion is visible before it turns into 429s.
fn observe_weight(response: &Response) {
    let Some(used) = response
        .headers()
        .get("x-mbx-used-weight-1m")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    else {
        return;
    };

    let remaining = WEIGHT_LIMIT_1M - used;
    if used > 5400 {
        error!(used, limit = WEIGHT_LIMIT_1M, remaining, "Critical API weight usage");
    } else if used > 3000 {
        warn!(used, limit = WEIGHT_LIMIT_1M, remaining, "High API weight usage");
    } else {
        debug!(used, limit = WEIGHT_LIMIT_1M, remaining, "API weight");
    }
}

async fn parse_response(response: Response) -> Result<String> {
    let status_code = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| Error::GenericRequest(e.to_string()))?;

    if status_code < 400 {
        return Ok(text);
    }

    if (400..500).contains(&status_code) {
        let client_error = match serde_json::from_str::<ErrorData>(&text) {
            Ok(data) => Error::client_error(status_code, Some(data.code), data.msg),
            Err(_) => Error::client_error(status_code, None, text),
        };
        return Err(client_error);
    }

    Err(Error::server_error(status_code, text))
}
