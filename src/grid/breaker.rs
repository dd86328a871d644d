//! Crash circuit breaker gating new entries.
//!
//! Evaluates the drawdown from the 15-minute high (three 5-minute candles)
//! before every entry attempt. Kline failures block trading: the gate fails
//! closed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::exchange::Exchange;
use crate::grid::notify::{AlertClass, Notifier};
use crate::types::Kline;

/// Candles in the lookback window.
const WINDOW_CANDLES: u32 = 3;
/// Keep the last kline fetch this long; ticks arrive far faster than the
/// 5-minute candles move.
const KLINE_CACHE_TTL: Duration = Duration::from_secs(10);

pub struct CircuitBreaker {
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    symbol: String,
    enabled: bool,
    /// Drawdown fraction that fires the breaker
    threshold: f64,
    cooldown: Duration,
    triggered_at: Mutex<Option<Instant>>,
    kline_cache: Mutex<Option<(Instant, Vec<Kline>)>>,
}

impl CircuitBreaker {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        notifier: Arc<dyn Notifier>,
        symbol: impl Into<String>,
        enabled: bool,
        threshold: f64,
        cooldown: Duration,
    ) -> Self {
        Self {
            exchange,
            notifier,
            symbol: symbol.into(),
            enabled,
            threshold,
            cooldown,
            triggered_at: Mutex::new(None),
            kline_cache: Mutex::new(None),
        }
    }

    /// Whether new entries are currently safe.
    pub async fn entries_allowed(&self, current_price: f64) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(klines) = self.recent_klines().await else {
            // Fail closed: no market data, no new entries.
            error!(target: "grid_trader::breaker", "Kline fetch failed, blocking entries");
            return false;
        };

        let max_high = klines.iter().map(Kline::high_f64).fold(0.0_f64, f64::max);
        if max_high <= 0.0 {
            return false;
        }
        let drawdown = (max_high - current_price) / max_high;

        let mut triggered = self.triggered_at.lock().unwrap_or_else(|e| e.into_inner());
        match *triggered {
            Some(since) => {
                if since.elapsed() < self.cooldown {
                    debug!(target: "grid_trader::breaker", drawdown, "Breaker active, entries blocked");
                    return false;
                }
                if drawdown < self.threshold {
                    *triggered = None;
                    spawn_alert(&self.notifier, format!(
                        "Circuit breaker normalized: drawdown {:.2}% below threshold",
                        drawdown * 100.0
                    ));
                    true
                } else {
                    // Still falling; restart the cooldown.
                    *triggered = Some(Instant::now());
                    warn!(
                        target: "grid_trader::breaker",
                        drawdown,
                        "Drawdown persists past cooldown, breaker re-armed"
                    );
                    false
                }
            }
            None => {
                if drawdown > self.threshold {
                    *triggered = Some(Instant::now());
                    warn!(
                        target: "grid_trader::breaker",
                        drawdown,
                        threshold = self.threshold,
                        "Rapid drawdown detected, blocking new entries"
                    );
                    spawn_alert(&self.notifier, format!(
                        "Circuit breaker fired: {:.2}% drawdown from 15m high",
                        drawdown * 100.0
                    ));
                    false
                } else {
                    true
                }
            }
        }
    }

    async fn recent_klines(&self) -> Option<Vec<Kline>> {
        {
            let cache = self.kline_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((at, klines)) = cache.as_ref() {
                if at.elapsed() < KLINE_CACHE_TTL {
                    return Some(klines.clone());
                }
            }
        }

        match self.exchange.klines(&self.symbol, "5m", WINDOW_CANDLES).await {
            Ok(klines) if !klines.is_empty() => {
                let mut cache = self.kline_cache.lock().unwrap_or_else(|e| e.into_inner());
                *cache = Some((Instant::now(), klines.clone()));
                Some(klines)
            }
            Ok(_) => None,
            Err(_) => None,
        }
    }
}

/// Alerts are fire-and-forget; the breaker decision must not block on the
/// notifier.
fn spawn_alert(notifier: &Arc<dyn Notifier>, message: String) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        notifier.alert(AlertClass::CircuitBreaker, &message).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
    use crate::grid::notify::LogNotifier;

    fn kline(high: f64) -> Kline {
        Kline {
            open_time: 0,
            open: format!("{high}"),
            high: format!("{high}"),
            low: format!("{high}"),
            close: format!("{high}"),
            volume: "1".to_string(),
            close_time: 0,
        }
    }

    fn breaker(sim: Arc<SimExchange>, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            sim,
            Arc::new(LogNotifier::new()),
            "BTCUSDT",
            true,
            0.02,
            cooldown,
        )
    }

    #[tokio::test]
    async fn allows_entries_in_calm_market() {
        let sim = Arc::new(SimExchange::new());
        sim.set_klines("5m", vec![kline(80000.0), kline(80100.0), kline(80050.0)]);
        let breaker = breaker(sim, Duration::from_secs(900));
        assert!(breaker.entries_allowed(79800.0).await);
    }

    #[tokio::test]
    async fn blocks_on_drawdown_past_threshold() {
        let sim = Arc::new(SimExchange::new());
        sim.set_klines("5m", vec![kline(80000.0), kline(82000.0), kline(81000.0)]);
        let breaker = breaker(sim, Duration::from_secs(900));
        // 3% below the 15m high of 82000.
        assert!(!breaker.entries_allowed(79540.0).await);
        // Still blocked inside the cooldown even if price recovers.
        assert!(!breaker.entries_allowed(82000.0).await);
    }

    #[tokio::test]
    async fn clears_after_cooldown_when_recovered() {
        let sim = Arc::new(SimExchange::new());
        sim.set_klines("5m", vec![kline(82000.0)]);
        let breaker = breaker(sim, Duration::from_millis(0));
        assert!(!breaker.entries_allowed(79540.0).await);
        // Cooldown elapsed and the drawdown is back under the threshold.
        assert!(breaker.entries_allowed(81900.0).await);
    }

    #[tokio::test]
    async fn rearms_when_still_down_after_cooldown() {
        let sim = Arc::new(SimExchange::new());
        sim.set_klines("5m", vec![kline(82000.0)]);
        let breaker = breaker(sim, Duration::from_millis(0));
        assert!(!breaker.entries_allowed(79540.0).await);
        // Cooldown elapsed but the market has not recovered.
        assert!(!breaker.entries_allowed(79540.0).await);
    }

    #[tokio::test]
    async fn fails_closed_without_klines() {
        let sim = Arc::new(SimExchange::new());
        let breaker = breaker(sim, Duration::from_secs(900));
        assert!(!breaker.entries_allowed(80000.0).await);
    }

    #[tokio::test]
    async fn disabled_breaker_always_allows() {
        let sim = Arc::new(SimExchange::new());
        let breaker = CircuitBreaker::new(
            sim,
            Arc::new(LogNotifier::new()),
            "BTCUSDT",
            false,
            0.02,
            Duration::from_secs(900),
        );
        assert!(breaker.entries_allowed(1.0).await);
    }
}
