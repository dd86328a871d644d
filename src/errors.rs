use thiserror::Error;

/// HTTP error classification
#[derive(Error, Debug, Clone)]
pub enum HttpErrorKind {
    #[error("Client error (code: {code:?}): {message}")]
    Client { code: Option<i32>, message: String },
    #[error("Server error: {message}")]
    Server { message: String },
}

/// Main error type for the grid trader.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// HTTP error with status code and classification
    #[error("HTTP error (status {status}): {kind}")]
    Http { status: u16, kind: HttpErrorKind },

    /// Generic request error (network, timeout)
    #[error("Generic request error: {0}")]
    GenericRequest(String),

    /// WebSocket connection error
    #[error("Websocket error: {0}")]
    Websocket(String),

    /// JSON parse error
    #[error("Json parse error: {0}")]
    JsonParse(String),

    /// Float string parse error
    #[error("Invalid float string: {0}")]
    FloatStringParse(String),

    /// Post-only order would have matched as a taker
    #[error("Post-only order would immediately match")]
    PostOnlyReject,

    /// Order unknown to the exchange
    #[error("Order not found on exchange")]
    OrderNotFound,

    /// Order refused before submission (filters, notional)
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// Symbol missing from exchange info
    #[error("Symbol not found in exchange info: {0}")]
    SymbolNotFound(String),

    /// Ledger store failure (IO, serialization)
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Transaction missing from the active ledger
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Fatal configuration error
    #[error("Config error: {0}")]
    Config(String),
}

/// Binance rejection code for post-only orders that would cross the spread.
const CODE_POST_ONLY_REJECT: i32 = -2010;
/// Binance codes for cancel/query of an order the engine no longer knows.
const CODE_UNKNOWN_ORDER: i32 = -2011;
const CODE_ORDER_DOES_NOT_EXIST: i32 = -2013;

impl Error {
    /// Create an HTTP client error.
    pub fn client_error(status: u16, code: Option<i32>, message: String) -> Self {
        Error::Http {
            status,
            kind: HttpErrorKind::Client { code, message },
        }
    }

    /// Create an HTTP server error.
    pub fn server_error(status: u16, message: String) -> Self {
        Error::Http {
            status,
            kind: HttpErrorKind::Server { message },
        }
    }

    /// Exchange error code carried by a client-side HTTP error, if any.
    pub fn exchange_code(&self) -> Option<i32> {
        match self {
            Error::Http {
                kind: HttpErrorKind::Client { code, .. },
                ..
            } => *code,
            _ => None,
        }
    }

    /// Fold well-known exchange rejection codes into domain errors.
    pub fn from_exchange(self) -> Self {
        match self.exchange_code() {
            Some(CODE_POST_ONLY_REJECT) => Error::PostOnlyReject,
            Some(CODE_UNKNOWN_ORDER) | Some(CODE_ORDER_DOES_NOT_EXIST) => Error::OrderNotFound,
            _ => self,
        }
    }

    /// True for failures worth retrying at the call site (network, 5xx).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::GenericRequest(_)
                | Error::Http {
                    kind: HttpErrorKind::Server { .. },
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_only_code_maps_to_domain_error() {
        let err = Error::client_error(400, Some(-2010), "would immediately match".into());
        assert!(matches!(err.from_exchange(), Error::PostOnlyReject));
    }

    #[test]
    fn unknown_order_codes_map_to_not_found() {
        for code in [-2011, -2013] {
            let err = Error::client_error(400, Some(code), "unknown order".into());
            assert!(matches!(err.from_exchange(), Error::OrderNotFound));
        }
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(Error::server_error(503, "unavailable".into()).is_transient());
        assert!(!Error::client_error(400, None, "bad".into()).is_transient());
    }
}
