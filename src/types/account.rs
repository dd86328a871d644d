//! Account and balance types.

use serde::{Deserialize, Serialize};

/// A single asset balance from account info.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: String,
    pub locked: String,
}

impl AssetBalance {
    pub fn free_f64(&self) -> f64 {
        self.free.parse().unwrap_or(0.0)
    }
}

/// Account info as returned by the exchange.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    /// Maker commission in basis points
    pub maker_commission: i64,
    /// Taker commission in basis points
    pub taker_commission: i64,
    pub can_trade: bool,
    pub balances: Vec<AssetBalance>,
}

impl AccountInfo {
    /// Free balance for an asset, zero when absent.
    pub fn free(&self, asset: &str) -> f64 {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free_f64())
            .unwrap_or(0.0)
    }
}
