//! Volatility-driven grid spacing.
//!
//! Polls 1-minute candles, computes per-candle Garman-Klass variance, and
//! publishes a spacing snapshot consumed by the controller and the order
//! pipeline.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::grid::config::VolatilitySettings;
use crate::types::Kline;

/// Poll cadence for the 1-minute candle fetch.
const POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Candles fetched per poll: long window plus headroom.
const FETCH_LIMIT: u32 = 30;
/// Short/long averaging windows (candles).
const SHORT_WINDOW: usize = 5;
const LONG_WINDOW: usize = 20;
/// Acceleration factor and noise floor for regime detection.
const REGIME_RATIO: f64 = 1.5;
const REGIME_MIN_SIGMA: f64 = 0.002;
/// Spacing floor; tighter grids starve on fees.
const MIN_SPACING: f64 = 0.001;

/// Volatility regime flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolRegime {
    Normal,
    HighVol,
}

/// Published estimator state.
#[derive(Debug, Clone, Copy)]
pub struct VolatilitySnapshot {
    pub sigma_short: f64,
    pub sigma_long: f64,
    pub regime: VolRegime,
    pub multiplier: f64,
    pub spacing: f64,
}

/// Garman-Klass estimator with a lock-guarded snapshot.
pub struct VolatilityEstimator {
    exchange: Arc<dyn Exchange>,
    symbol: String,
    settings: VolatilitySettings,
    snapshot: RwLock<Option<VolatilitySnapshot>>,
}

impl VolatilityEstimator {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        symbol: impl Into<String>,
        settings: VolatilitySettings,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            settings,
            snapshot: RwLock::new(None),
        }
    }

    /// Current dynamic spacing. Configured fallback before the first sample.
    pub fn spacing(&self) -> f64 {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .map(|s| s.spacing)
            .unwrap_or(self.settings.fallback_spacing_pct)
    }

    /// Copy of the current snapshot, if one has been computed.
    pub fn snapshot(&self) -> Option<VolatilitySnapshot> {
        *self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch candles and recompute the snapshot.
    pub async fn refresh(&self) -> Result<()> {
        let klines = self
            .exchange
            .klines(&self.symbol, "1m", FETCH_LIMIT)
            .await?;
        if klines.len() < LONG_WINDOW {
            warn!(
                target: "grid_trader::volatility",
                count = klines.len(),
                "Not enough klines for volatility calculation"
            );
            return Ok(());
        }

        let sigma_short = garman_klass_sigma(&klines[klines.len() - SHORT_WINDOW..]);
        let sigma_long = garman_klass_sigma(&klines[klines.len() - LONG_WINDOW..]);

        let (regime, multiplier) = if sigma_long > 0.0
            && sigma_short > sigma_long * REGIME_RATIO
            && sigma_short > REGIME_MIN_SIGMA
        {
            (VolRegime::HighVol, self.settings.high_vol_multiplier)
        } else {
            (VolRegime::Normal, self.settings.low_vol_multiplier)
        };

        let spacing = (sigma_short * multiplier).max(MIN_SPACING);
        let snapshot = VolatilitySnapshot {
            sigma_short,
            sigma_long,
            regime,
            multiplier,
            spacing,
        };
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);

        info!(
            target: "grid_trader::volatility",
            sigma_short,
            sigma_long,
            regime = ?regime,
            multiplier,
            spacing,
            "Volatility updated"
        );
        Ok(())
    }

    /// High/low of the most recent 1-hour candle; used by the metrics
    /// collaborator.
    pub async fn last_hour_range(&self) -> Result<(f64, f64)> {
        let klines = self.exchange.klines(&self.symbol, "1h", 1).await?;
        let kline = klines
            .last()
            .ok_or_else(|| Error::GenericRequest("no klines returned".to_string()))?;
        Ok((kline.high_f64(), kline.low_f64()))
    }

    /// Poll loop: refresh every minute until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        error!(target: "grid_trader::volatility", error = %e, "Volatility refresh failed");
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }
}

/// Average per-candle Garman-Klass variance, returned as a volatility:
///
/// sigma^2 = 0.5*(ln(H/L))^2 - (2*ln2 - 1)*(ln(C/O))^2
fn garman_klass_sigma(klines: &[Kline]) -> f64 {
    let coefficient = 2.0 * std::f64::consts::LN_2 - 1.0;
    let mut sum = 0.0;
    let mut count = 0usize;

    for kline in klines {
        let (o, h, l, c) = (
            kline.open_f64(),
            kline.high_f64(),
            kline.low_f64(),
            kline.close_f64(),
        );
        if o <= 0.0 || l <= 0.0 {
            continue;
        }
        let hl = (h / l).ln();
        let co = (c / o).ln();
        sum += 0.5 * hl * hl - coefficient * co * co;
        count += 1;
    }

    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).max(0.0).sqrt()
}
