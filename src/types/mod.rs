//! Consolidated type definitions for the grid trader.
//!
//! This module contains shared types used across REST API responses,
//! WebSocket messages, and exchange operations.

mod account;
mod filters;
mod klines;
mod orders;
mod ticker;

pub use account::*;
pub use filters::*;
pub use klines::*;
pub use orders::*;
pub use ticker::*;

/// Tolerance for quantity equality when matching ledger rows against
/// exchange orders.
pub const QTY_EPSILON: f64 = 1e-8;

/// Parse a decimal string field from an exchange payload.
pub fn parse_decimal(s: &str) -> crate::errors::Result<f64> {
    s.parse::<f64>()
        .map_err(|_| crate::errors::Error::FloatStringParse(s.to_string()))
}

/// Format a price/quantity as a decimal string with stable precision.
///
/// Eight fractional digits, trailing zeros trimmed. Keeps persisted values
/// free of binary-float drift across load/store cycles.
pub fn format_decimal(value: f64) -> String {
    let s = format!("{value:.8}");
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
