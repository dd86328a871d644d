//! Account balance cache refreshed by the balance-sync task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use tracing::debug;

use crate::types::AccountInfo;

/// Free-balance snapshot per asset, values handed out by copy.
#[derive(Default)]
pub struct BalanceCache {
    free: RwLock<HashMap<String, f64>>,
    maker_commission_bps: AtomicI64,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot from a fresh account-info response.
    pub fn apply_account(&self, info: &AccountInfo) {
        let mut map = self.free.write().unwrap_or_else(|e| e.into_inner());
        map.clear();
        for balance in &info.balances {
            map.insert(balance.asset.clone(), balance.free_f64());
        }
        self.maker_commission_bps
            .store(info.maker_commission, Ordering::Relaxed);
        debug!(target: "grid_trader::ledger", assets = map.len(), "Balances refreshed");
    }

    /// Free balance for an asset, zero when unknown.
    pub fn free(&self, asset: &str) -> f64 {
        self.free
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(asset)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn maker_commission_bps(&self) -> i64 {
        self.maker_commission_bps.load(Ordering::Relaxed)
    }

    /// Direct override, used by tests and the simulator harness.
    pub fn set_free(&self, asset: &str, amount: f64) {
        self.free
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(asset.to_string(), amount);
    }
}
