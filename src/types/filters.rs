//! Symbol trading filters and boundary quantization.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Raw exchange-info response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub filters: Vec<RawFilter>,
}

/// One trading-rule filter. Only the fields the grid needs are kept.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFilter {
    pub filter_type: String,
    #[serde(default)]
    pub tick_size: Option<String>,
    #[serde(default)]
    pub step_size: Option<String>,
    #[serde(default)]
    pub min_qty: Option<String>,
    #[serde(default)]
    pub min_notional: Option<String>,
}

/// Slack applied before flooring in the snap helpers.
const SNAP_EPSILON: f64 = 1e-9;

/// Resolved per-symbol trading constraints.
///
/// Every price sent to the exchange is snapped down to `tick_size`, every
/// quantity down to `step_size`; orders below `min_notional` are refused
/// before submission.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

impl SymbolFilters {
    /// Extract the filters for `symbol` from an exchange-info response.
    pub fn from_info(info: &ExchangeInfo, symbol: &str) -> Result<Self> {
        let sym = info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| Error::SymbolNotFound(symbol.to_string()))?;

        let mut filters = SymbolFilters {
            tick_size: 0.01,
            step_size: 0.00001,
            min_qty: 0.00001,
            min_notional: 5.0,
        };

        for f in &sym.filters {
            match f.filter_type.as_str() {
                "PRICE_FILTER" => {
                    if let Some(v) = f.tick_size.as_deref().and_then(|v| v.parse().ok()) {
                        filters.tick_size = v;
                    }
                }
                "LOT_SIZE" => {
                    if let Some(v) = f.step_size.as_deref().and_then(|v| v.parse().ok()) {
                        filters.step_size = v;
                    }
                    if let Some(v) = f.min_qty.as_deref().and_then(|v| v.parse().ok()) {
                        filters.min_qty = v;
                    }
                }
                "MIN_NOTIONAL" | "NOTIONAL" => {
                    if let Some(v) = f.min_notional.as_deref().and_then(|v| v.parse().ok()) {
                        filters.min_notional = v;
                    }
                }
                _ => {}
            }
        }

        Ok(filters)
    }

    /// Snap a price down to the nearest tick.
    ///
    /// The epsilon keeps exact multiples from dropping a whole tick when the
    /// division lands a hair under an integer.
    pub fn snap_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size + SNAP_EPSILON).floor() * self.tick_size
    }

    /// Snap a quantity down to the nearest lot step.
    pub fn snap_qty(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 {
            return qty;
        }
        (qty / self.step_size + SNAP_EPSILON).floor() * self.step_size
    }

    /// Whether an order clears the exchange's minimum notional.
    pub fn meets_notional(&self, price: f64, qty: f64) -> bool {
        price * qty >= self.min_notional
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: 0.01,
            step_size: 0.00001,
            min_qty: 0.00001,
            min_notional: 5.0,
        }
    }

    #[test]
    fn snaps_price_down_to_tick() {
        let f = filters();
        assert!((f.snap_price(80000.017) - 80000.01).abs() < 1e-9);
        assert!((f.snap_price(80000.0) - 80000.0).abs() < 1e-9);
    }

    #[test]
    fn snaps_qty_down_to_step() {
        let f = filters();
        assert!((f.snap_qty(0.000125678) - 0.00012).abs() < 1e-12);
    }

    #[test]
    fn exact_multiples_survive_snapping() {
        let f = SymbolFilters {
            tick_size: 0.01,
            step_size: 0.000001,
            min_qty: 0.000001,
            min_notional: 5.0,
        };
        // 10 / 80000: an exact multiple of the step must not lose a step.
        assert!((f.snap_qty(10.0 / 80000.0) - 0.000125).abs() < 1e-15);
        assert!((f.snap_price(80400.0000000000002) - 80400.0).abs() < 1e-9);
    }

    #[test]
    fn notional_gate() {
        let f = filters();
        assert!(f.meets_notional(80000.0, 0.000125));
        assert!(!f.meets_notional(80000.0, 0.00002));
    }

    #[test]
    fn resolves_filters_from_info() {
        let info: ExchangeInfo = serde_json::from_value(serde_json::json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.01"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.00001", "minQty": "0.00001"},
                    {"filterType": "NOTIONAL", "minNotional": "10.0"}
                ]
            }]
        }))
        .unwrap();
        let f = SymbolFilters::from_info(&info, "BTCUSDT").unwrap();
        assert!((f.min_notional - 10.0).abs() < 1e-9);
        assert!(SymbolFilters::from_info(&info, "ETHUSDT").is_err());
    }
}
