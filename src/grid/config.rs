//! Configuration for the grid trading agent.
//!
//! TOML file + environment + CLI overrides. Every tunable carries a serde
//! default so a partial file stays valid.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::exchange::MAINNET_API_URL;
use crate::logging::LogSettings;
use crate::ws::MAINNET_WS_URL;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub grid: GridSettings,
    #[serde(default)]
    pub volatility: VolatilitySettings,
    #[serde(default)]
    pub reposition: RepositionSettings,
    #[serde(default)]
    pub safety: SafetySettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub logging: LogSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeConfig {
    /// REST endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// WebSocket endpoint
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// API key (prefer the BINANCE_API_KEY environment variable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Secret key (prefer the BINANCE_SECRET_KEY environment variable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

fn default_base_url() -> String {
    MAINNET_API_URL.to_string()
}

fn default_ws_url() -> String {
    MAINNET_WS_URL.to_string()
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            api_key: None,
            secret_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GridSettings {
    /// Trading pair
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Base asset of the pair (inventory side)
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
    /// Quote asset of the pair (funding side)
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Lower bound of the operating price range
    #[serde(default)]
    pub range_min: f64,
    /// Upper bound of the operating price range
    #[serde(default = "default_range_max")]
    pub range_max: f64,
    /// Maximum number of simultaneous rungs (open + inventory)
    #[serde(default = "default_grid_levels")]
    pub grid_levels: usize,
    /// Fraction of the quote balance committed per rung
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: f64,
    /// Floor for a single rung's quote value
    #[serde(default = "default_min_order_value")]
    pub min_order_value: f64,
    /// Minimum net profit target
    #[serde(default = "default_min_net_profit_pct")]
    pub min_net_profit_pct: f64,
    #[serde(default = "default_maker_fee_pct")]
    pub maker_fee_pct: f64,
    #[serde(default = "default_taker_fee_pct")]
    pub taker_fee_pct: f64,
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}
fn default_base_asset() -> String {
    "BTC".to_string()
}
fn default_quote_asset() -> String {
    "USDT".to_string()
}
fn default_range_max() -> f64 {
    f64::MAX
}
fn default_grid_levels() -> usize {
    5
}
fn default_position_size_pct() -> f64 {
    0.1
}
fn default_min_order_value() -> f64 {
    10.0
}
fn default_min_net_profit_pct() -> f64 {
    0.005
}
fn default_maker_fee_pct() -> f64 {
    0.001
}
fn default_taker_fee_pct() -> f64 {
    0.001
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            base_asset: default_base_asset(),
            quote_asset: default_quote_asset(),
            range_min: 0.0,
            range_max: default_range_max(),
            grid_levels: default_grid_levels(),
            position_size_pct: default_position_size_pct(),
            min_order_value: default_min_order_value(),
            min_net_profit_pct: default_min_net_profit_pct(),
            maker_fee_pct: default_maker_fee_pct(),
            taker_fee_pct: default_taker_fee_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VolatilitySettings {
    /// Spacing multiplier in the high-volatility regime
    #[serde(default = "default_high_vol_multiplier")]
    pub high_vol_multiplier: f64,
    /// Spacing multiplier in the normal regime
    #[serde(default = "default_low_vol_multiplier")]
    pub low_vol_multiplier: f64,
    /// Spacing used before the first volatility sample arrives
    #[serde(default = "default_fallback_spacing_pct")]
    pub fallback_spacing_pct: f64,
}

fn default_high_vol_multiplier() -> f64 {
    3.5
}
fn default_low_vol_multiplier() -> f64 {
    1.8
}
fn default_fallback_spacing_pct() -> f64 {
    0.005
}

impl Default for VolatilitySettings {
    fn default() -> Self {
        Self {
            high_vol_multiplier: default_high_vol_multiplier(),
            low_vol_multiplier: default_low_vol_multiplier(),
            fallback_spacing_pct: default_fallback_spacing_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositionSettings {
    /// Relative distance above the highest entry that counts as runaway
    #[serde(default = "default_reposition_pct")]
    pub reposition_pct: f64,
    /// Minimum order age before a runaway reposition (minutes)
    #[serde(default = "default_reposition_cooldown_min")]
    pub cooldown_min: i64,
    /// Order age that counts as stagnation (minutes)
    #[serde(default = "default_reposition_max_idle_min")]
    pub max_idle_min: i64,
}

fn default_reposition_pct() -> f64 {
    0.005
}
fn default_reposition_cooldown_min() -> i64 {
    5
}
fn default_reposition_max_idle_min() -> i64 {
    20
}

impl Default for RepositionSettings {
    fn default() -> Self {
        Self {
            reposition_pct: default_reposition_pct(),
            cooldown_min: default_reposition_cooldown_min(),
            max_idle_min: default_reposition_max_idle_min(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetySettings {
    /// Gate new entries behind the crash circuit breaker
    #[serde(default = "default_crash_protection")]
    pub crash_protection_enabled: bool,
    /// 15-minute drawdown that fires the breaker
    #[serde(default = "default_max_drop_pct_5m")]
    pub max_drop_pct_5m: f64,
    /// Breaker cooldown (minutes)
    #[serde(default = "default_crash_pause_min")]
    pub crash_pause_min: i64,
    /// Soft pause: suppress new entries while allowing exits and
    /// reconciliation. Re-read from the config file every cycle.
    #[serde(default)]
    pub pause_buys: bool,
}

fn default_crash_protection() -> bool {
    true
}
fn default_max_drop_pct_5m() -> f64 {
    0.02
}
fn default_crash_pause_min() -> i64 {
    15
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            crash_protection_enabled: default_crash_protection(),
            max_drop_pct_5m: default_max_drop_pct_5m(),
            crash_pause_min: default_crash_pause_min(),
            pause_buys: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerSettings {
    #[serde(default = "default_active_file")]
    pub active_file: String,
    #[serde(default = "default_history_file")]
    pub history_file: String,
}

fn default_active_file() -> String {
    "transactions.json".to_string()
}
fn default_history_file() -> String {
    "logs/transactions_history.json".to_string()
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            active_file: default_active_file(),
            history_file: default_history_file(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))
    }

    /// Re-read only the soft-pause flag; falls back to the current value on
    /// any failure.
    pub fn reload_pause_buys(path: &Path, current: bool) -> bool {
        Self::load_from(path)
            .map(|cfg| cfg.safety.pause_buys)
            .unwrap_or(current)
    }

    /// Fatal-at-startup validation.
    pub fn validate(&self) -> Result<()> {
        let g = &self.grid;
        if g.symbol.is_empty() {
            return Err(Error::Config("symbol is required".into()));
        }
        if g.range_min < 0.0 || g.range_min >= g.range_max {
            return Err(Error::Config("range_min must be below range_max".into()));
        }
        if g.grid_levels == 0 {
            return Err(Error::Config("grid_levels must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&g.position_size_pct) || g.position_size_pct == 0.0 {
            return Err(Error::Config("position_size_pct must be in (0, 1]".into()));
        }
        if g.min_order_value <= 0.0 {
            return Err(Error::Config("min_order_value must be positive".into()));
        }
        let v = &self.volatility;
        if v.high_vol_multiplier <= 0.0 || v.low_vol_multiplier <= 0.0 {
            return Err(Error::Config("volatility multipliers must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.safety.max_drop_pct_5m) {
            return Err(Error::Config("max_drop_pct_5m must be in [0, 1)".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut cfg = AppConfig::default();
        cfg.grid.range_max = 100_000.0;
        cfg.validate().unwrap();
        assert_eq!(cfg.grid.grid_levels, 5);
        assert!((cfg.volatility.high_vol_multiplier - 3.5).abs() < 1e-9);
        assert!((cfg.reposition.reposition_pct - 0.005).abs() < 1e-9);
        assert!(cfg.safety.crash_protection_enabled);
        assert!(!cfg.safety.pause_buys);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [grid]
            symbol = "ETHUSDT"
            range_min = 2000.0
            range_max = 4000.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.grid.symbol, "ETHUSDT");
        assert_eq!(cfg.grid.grid_levels, 5);
        assert!((cfg.safety.max_drop_pct_5m - 0.02).abs() < 1e-9);
    }

    #[test]
    fn validation_rejects_inverted_range() {
        let mut cfg = AppConfig::default();
        cfg.grid.range_min = 100.0;
        cfg.grid.range_max = 50.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_levels() {
        let mut cfg = AppConfig::default();
        cfg.grid.range_max = 100_000.0;
        cfg.grid.grid_levels = 0;
        assert!(cfg.validate().is_err());
    }
}
