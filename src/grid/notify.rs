//! Notification and metrics ports.
//!
//! Delivery (chat, CSV collection) lives outside the core; the core emits
//! through these traits and rate-limits operational alarms to one per hour
//! per class.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::ledger::Transaction;

/// Operational alarm classes, rate-limited independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertClass {
    /// Post-only entry placement exhausted its retries
    PlacementFailure,
    /// Paired exit could not be placed
    ExitFailure,
    /// Quote or base balance too low to act
    LowFunds,
    /// Crash circuit breaker fired or cleared
    CircuitBreaker,
    /// Reconciliation found and corrected divergence
    StateInconsistency,
}

impl AlertClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertClass::PlacementFailure => "placement_failure",
            AlertClass::ExitFailure => "exit_failure",
            AlertClass::LowFunds => "low_funds",
            AlertClass::CircuitBreaker => "circuit_breaker",
            AlertClass::StateInconsistency => "state_inconsistency",
        }
    }
}

/// Outbound notification port.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A rung changed state in a way an operator cares about.
    async fn trade_event(&self, tx: &Transaction, realized_profit: Option<f64>);

    /// Operational alarm. Implementations receive already rate-limited
    /// traffic.
    async fn alert(&self, class: AlertClass, message: &str);
}

/// Hourly metrics collection port; the CSV collector lives outside the core.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn collect_hourly(&self);
}

/// Per-class rate limiter for operational alarms.
pub struct AlertGate {
    min_interval: Duration,
    last: Mutex<HashMap<AlertClass, Instant>>,
}

impl AlertGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// One alarm per class per interval.
    pub fn allow(&self, class: AlertClass) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match last.get(&class) {
            Some(prev) if now.duration_since(*prev) < self.min_interval => false,
            _ => {
                last.insert(class, now);
                true
            }
        }
    }
}

impl Default for AlertGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

/// Default notifier: writes through the log stream.
pub struct LogNotifier {
    gate: AlertGate,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self {
            gate: AlertGate::default(),
        }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn trade_event(&self, tx: &Transaction, realized_profit: Option<f64>) {
        match realized_profit {
            Some(profit) => info!(
                id = %tx.id,
                status = ?tx.status,
                price = %tx.price,
                amount = %tx.amount,
                profit,
                "Trade event"
            ),
            None => info!(
                id = %tx.id,
                status = ?tx.status,
                price = %tx.price,
                amount = %tx.amount,
                "Trade event"
            ),
        }
    }

    async fn alert(&self, class: AlertClass, message: &str) {
        if !self.gate.allow(class) {
            return;
        }
        match class {
            AlertClass::ExitFailure | AlertClass::PlacementFailure => {
                error!(class = class.as_str(), "{message}")
            }
            _ => warn!(class = class.as_str(), "{message}"),
        }
    }
}

/// Default metrics sink: a log line per collection tick.
pub struct LogMetricsSink;

#[async_trait]
impl MetricsSink for LogMetricsSink {
    async fn collect_hourly(&self) {
        info!("Hourly metrics tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_limits_per_class() {
        let gate = AlertGate::new(Duration::from_secs(3600));
        assert!(gate.allow(AlertClass::LowFunds));
        assert!(!gate.allow(AlertClass::LowFunds));
        // A different class is tracked independently.
        assert!(gate.allow(AlertClass::CircuitBreaker));
    }

    #[test]
    fn gate_reopens_after_interval() {
        let gate = AlertGate::new(Duration::from_millis(0));
        assert!(gate.allow(AlertClass::LowFunds));
        assert!(gate.allow(AlertClass::LowFunds));
    }
}
