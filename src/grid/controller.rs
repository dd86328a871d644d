//! Grid controller: decides when to open a rung, when to reposition, and
//! when to stand down.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::grid::breaker::CircuitBreaker;
use crate::grid::config::{AppConfig, GridSettings, RepositionSettings};
use crate::grid::notify::{AlertClass, Notifier};
use crate::grid::pipeline::OrderPipeline;
use crate::grid::volatility::VolatilityEstimator;
use crate::ledger::{BalanceCache, LedgerStore, Transaction, TxKind, TxStatus};

/// Fraction of the dynamic spacing inside which a new rung is refused as
/// too close to an existing one.
const PROXIMITY_FACTOR: f64 = 0.5;
/// Grid-gap reposition trigger, in spacings.
const GRID_GAP_FACTOR: f64 = 2.5;

pub struct GridController {
    exchange: Arc<dyn Exchange>,
    ledger: Arc<LedgerStore>,
    pipeline: Arc<OrderPipeline>,
    volatility: Arc<VolatilityEstimator>,
    breaker: Arc<CircuitBreaker>,
    balances: Arc<BalanceCache>,
    notifier: Arc<dyn Notifier>,
    grid: GridSettings,
    reposition: RepositionSettings,
    /// Config file re-read each cycle for the soft-pause flag.
    config_path: Option<PathBuf>,
    pause_buys_default: bool,
}

impl GridController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        ledger: Arc<LedgerStore>,
        pipeline: Arc<OrderPipeline>,
        volatility: Arc<VolatilityEstimator>,
        breaker: Arc<CircuitBreaker>,
        balances: Arc<BalanceCache>,
        notifier: Arc<dyn Notifier>,
        grid: GridSettings,
        reposition: RepositionSettings,
        config_path: Option<PathBuf>,
        pause_buys_default: bool,
    ) -> Self {
        Self {
            exchange,
            ledger,
            pipeline,
            volatility,
            breaker,
            balances,
            notifier,
            grid,
            reposition,
            config_path,
            pause_buys_default,
        }
    }

    fn soft_paused(&self) -> bool {
        match &self.config_path {
            Some(path) => AppConfig::reload_pause_buys(path, self.pause_buys_default),
            None => self.pause_buys_default,
        }
    }

    /// Price-tick entry point.
    pub async fn on_tick(&self, bid: f64, ask: f64) -> Result<()> {
        if self.soft_paused() {
            debug!(target: "grid_trader::controller", "Soft pause active, skipping entries");
            return Ok(());
        }
        if self.pipeline.buy_cooldown_active() {
            debug!(target: "grid_trader::controller", "Buy cooldown active, skipping entries");
            return Ok(());
        }
        if !self.breaker.entries_allowed(bid).await {
            return Ok(());
        }

        let rungs: Vec<Transaction> = self
            .ledger
            .all()
            .into_iter()
            .filter(|t| t.symbol == self.grid.symbol && t.kind == TxKind::Buy)
            .collect();
        let active_buys: Vec<&Transaction> = rungs
            .iter()
            .filter(|t| t.status == TxStatus::Open)
            .collect();
        let inventory: Vec<&Transaction> = rungs
            .iter()
            .filter(|t| t.status.is_inventory())
            .collect();
        let spacing = self.volatility.spacing();

        let opened = self
            .maybe_open_rung(bid, ask, &active_buys, &inventory, spacing)
            .await?;
        if opened {
            // The snapshot predates the new rung; reposition next tick.
            return Ok(());
        }
        self.maybe_reposition(bid, &active_buys, &inventory, spacing)
            .await
    }

    async fn maybe_open_rung(
        &self,
        bid: f64,
        ask: f64,
        active_buys: &[&Transaction],
        inventory: &[&Transaction],
        spacing: f64,
    ) -> Result<bool> {
        if ask < self.grid.range_min || ask > self.grid.range_max {
            debug!(target: "grid_trader::controller", ask, "Price outside grid range");
            return Ok(false);
        }

        let lowest_active = active_buys
            .iter()
            .map(|t| t.price_f64())
            .fold(f64::INFINITY, f64::min);
        let seed = active_buys.is_empty();
        if !seed {
            let drop_pct = (lowest_active - ask) / lowest_active;
            if drop_pct < spacing {
                return Ok(false);
            }
        }

        let total_rungs = active_buys.len() + inventory.len();
        if total_rungs >= self.grid.grid_levels {
            debug!(target: "grid_trader::controller", total_rungs, "Grid full");
            return Ok(false);
        }

        let entry_price = bid;
        let too_close = active_buys
            .iter()
            .chain(inventory.iter())
            .any(|t| ((t.price_f64() - entry_price) / entry_price).abs() < PROXIMITY_FACTOR * spacing);
        if too_close {
            debug!(
                target: "grid_trader::controller",
                entry_price,
                "Existing rung within proximity guard, refusing new entry"
            );
            return Ok(false);
        }

        let quote_free = self.balances.free(&self.grid.quote_asset);
        let order_value = (quote_free * self.grid.position_size_pct).max(self.grid.min_order_value);
        if quote_free < order_value {
            self.notifier
                .alert(
                    AlertClass::LowFunds,
                    &format!(
                        "Insufficient {} for a new rung: need {order_value:.2}, have {quote_free:.2}",
                        self.grid.quote_asset
                    ),
                )
                .await;
            return Ok(false);
        }

        info!(
            target: "grid_trader::controller",
            entry_price,
            order_value,
            spacing,
            level = total_rungs + 1,
            seed,
            "Opening grid rung"
        );
        match self.pipeline.place_entry(entry_price, order_value).await {
            Ok(_) => Ok(true),
            Err(Error::OrderRejected(reason)) => {
                warn!(target: "grid_trader::controller", %reason, "Entry refused");
                Ok(false)
            }
            Err(e) if e.is_transient() => {
                warn!(target: "grid_trader::controller", error = %e, "Entry failed transiently");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Smart entry reposition: cancel a stale highest entry and re-enter at
    /// the current bid.
    async fn maybe_reposition(
        &self,
        bid: f64,
        active_buys: &[&Transaction],
        inventory: &[&Transaction],
        spacing: f64,
    ) -> Result<()> {
        let Some(highest) = active_buys
            .iter()
            .max_by(|a, b| a.price_f64().total_cmp(&b.price_f64()))
        else {
            return Ok(());
        };

        let price = highest.price_f64();
        if price <= 0.0 {
            return Ok(());
        }
        let distance = (bid - price) / price;
        let age_min = highest.age().num_minutes();

        let reason = if distance >= self.reposition.reposition_pct
            && inventory.is_empty()
            && age_min >= self.reposition.cooldown_min
        {
            "price runaway"
        } else if age_min >= self.reposition.max_idle_min {
            "stagnation"
        } else if distance >= GRID_GAP_FACTOR * spacing {
            "grid gap"
        } else {
            return Ok(());
        };

        info!(
            target: "grid_trader::controller",
            id = %highest.id,
            reason,
            distance,
            age_min,
            "Repositioning stale entry"
        );

        match self
            .exchange
            .cancel_order(&self.grid.symbol, &highest.id)
            .await
        {
            Ok(_) => {}
            Err(Error::OrderNotFound) => {
                // Raced a fill or cancel; the event path owns this rung now.
                debug!(target: "grid_trader::controller", id = %highest.id, "Reposition cancel raced, skipping");
                return Ok(());
            }
            Err(e) => {
                warn!(target: "grid_trader::controller", id = %highest.id, error = %e, "Reposition cancel failed");
                return Ok(());
            }
        }

        let mut stale = (*highest).clone();
        stale.transition(TxStatus::Closed, &format!("Repositioned ({reason})"));
        self.ledger.archive_and_remove(&stale)?;

        let quote_free = self.balances.free(&self.grid.quote_asset);
        let order_value = (quote_free * self.grid.position_size_pct).max(self.grid.min_order_value);
        match self.pipeline.place_entry(bid, order_value).await {
            Ok(_) => Ok(()),
            Err(Error::OrderRejected(reason)) => {
                warn!(target: "grid_trader::controller", %reason, "Reposition re-entry refused");
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(target: "grid_trader::controller", error = %e, "Reposition re-entry failed transiently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
    use crate::grid::config::VolatilitySettings;
    use crate::grid::notify::LogNotifier;
    use crate::types::{Kline, Side, SymbolFilters};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        sim: Arc<SimExchange>,
        ledger: Arc<LedgerStore>,
        balances: Arc<BalanceCache>,
        controller: GridController,
        _dir: TempDir,
    }

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

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let sim = Arc::new(SimExchange::new());
        sim.set_balance("BTC", 1.0);
        sim.set_balance("USDT", 100.0);
        // Calm market for the breaker.
        sim.set_klines("5m", vec![kline(80000.0), kline(80100.0), kline(80050.0)]);

        let ledger = Arc::new(LedgerStore::new(
            dir.path().join("transactions.json"),
            dir.path().join("history.json"),
        ));
        ledger.load().unwrap();
        let balances = Arc::new(BalanceCache::new());
        balances.set_free("USDT", 100.0);
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new());
        let volatility = Arc::new(VolatilityEstimator::new(
            sim.clone(),
            "BTCUSDT",
            VolatilitySettings::default(),
        ));
        let pipeline = Arc::new(OrderPipeline::new(
            sim.clone(),
            ledger.clone(),
            balances.clone(),
            volatility.clone(),
            notifier.clone(),
            SymbolFilters {
                tick_size: 0.01,
                step_size: 0.000001,
                min_qty: 0.000001,
                min_notional: 5.0,
            },
            "BTCUSDT",
            "BTC",
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            sim.clone(),
            notifier.clone(),
            "BTCUSDT",
            true,
            0.02,
            Duration::from_secs(900),
        ));

        let grid = GridSettings {
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            range_min: 60000.0,
            range_max: 100000.0,
            grid_levels: 5,
            position_size_pct: 0.1,
            min_order_value: 10.0,
            ..GridSettings::default()
        };
        let controller = GridController::new(
            sim.clone(),
            ledger.clone(),
            pipeline,
            volatility,
            breaker,
            balances.clone(),
            notifier,
            grid,
            RepositionSettings::default(),
            None,
            false,
        );

        Harness {
            sim,
            ledger,
            balances,
            controller,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn seeds_first_rung_at_best_bid() {
        let h = harness();
        h.controller.on_tick(80000.0, 80001.0).await.unwrap();

        let rungs = h.ledger.all();
        assert_eq!(rungs.len(), 1);
        assert_eq!(rungs[0].status, TxStatus::Open);
        assert_eq!(rungs[0].price, "80000");
        // 10 USDT at 80000 = 0.000125 BTC.
        assert_eq!(rungs[0].amount, "0.000125");
    }

    #[tokio::test]
    async fn refuses_entries_outside_range() {
        let h = harness();
        h.controller.on_tick(59000.0, 59001.0).await.unwrap();
        assert!(h.ledger.all().is_empty());
        h.controller.on_tick(101000.0, 101001.0).await.unwrap();
        assert!(h.ledger.all().is_empty());
    }

    #[tokio::test]
    async fn requires_spacing_below_lowest_active_rung() {
        let h = harness();
        h.controller.on_tick(80000.0, 80001.0).await.unwrap();
        assert_eq!(h.ledger.all().len(), 1);

        // 0.2% below: under the 0.5% fallback spacing, no second rung.
        h.controller.on_tick(79840.0, 79841.0).await.unwrap();
        assert_eq!(h.ledger.all().len(), 1);

        // A full spacing below: second rung opens.
        h.controller.on_tick(79500.0, 79501.0).await.unwrap();
        assert_eq!(h.ledger.all().len(), 2);
    }

    #[tokio::test]
    async fn proximity_guard_blocks_near_inventory() {
        let h = harness();
        // Inventory rung at 79501 (filled, holds base asset).
        let mut held = Transaction::new_entry("BUY_H", "BTCUSDT", 79501.0, 0.000125, "seed");
        held.transition(TxStatus::Filled, "filled");
        h.ledger.insert(held).unwrap();

        // No active buys, so the seed path applies; but the intended entry
        // at 79500 sits within 0.5 * spacing of the inventory rung.
        h.controller.on_tick(79500.0, 79501.0).await.unwrap();
        assert_eq!(h.ledger.all().len(), 1);
    }

    #[tokio::test]
    async fn respects_grid_level_cap() {
        let h = harness();
        // Fill the grid with inventory rungs far from the entry price.
        for (i, price) in [90000.0, 91000.0, 92000.0, 93000.0, 94000.0].iter().enumerate() {
            let mut tx = Transaction::new_entry(
                format!("BUY_{i}"),
                "BTCUSDT",
                *price,
                0.000125,
                "seed",
            );
            tx.transition(TxStatus::Filled, "filled");
            h.ledger.insert(tx).unwrap();
        }

        h.controller.on_tick(80000.0, 80001.0).await.unwrap();
        assert_eq!(h.ledger.all().len(), 5);
    }

    #[tokio::test]
    async fn low_quote_balance_blocks_entry() {
        let h = harness();
        h.balances.set_free("USDT", 5.0);
        h.controller.on_tick(80000.0, 80001.0).await.unwrap();
        assert!(h.ledger.all().is_empty());
    }

    #[tokio::test]
    async fn grid_gap_reposition_moves_stale_entry() {
        let h = harness();
        // Stale entry 2% below market: gap 0.02 >= 2.5 * 0.005.
        let stale = Transaction::new_entry("BUY_S", "BTCUSDT", 78400.0, 0.000125, "seed");
        h.ledger.insert(stale).unwrap();
        h.sim
            .seed_order("BUY_S", "BTCUSDT", Side::Buy, 78400.0, 0.000125, crate::types::OrderStatus::New);

        h.controller.on_tick(80000.0, 80001.0).await.unwrap();

        // Old rung archived, fresh rung at the current bid.
        assert!(h.ledger.get("BUY_S").is_none());
        let history = h.ledger.history().unwrap();
        let archived = history.iter().find(|t| t.id == "BUY_S").unwrap();
        assert!(archived.notes.contains("Repositioned"));
        let fresh: Vec<_> = h
            .ledger
            .all()
            .into_iter()
            .filter(|t| t.status == TxStatus::Open)
            .collect();
        assert!(fresh.iter().any(|t| t.price == "80000"));
    }

    #[tokio::test]
    async fn runaway_reposition_requires_empty_inventory() {
        let h = harness();
        // Entry 1% below market, older than the reposition cooldown.
        let mut stale = Transaction::new_entry("BUY_S", "BTCUSDT", 79900.0, 0.000125, "seed");
        stale.created_at = chrono::Utc::now() - chrono::Duration::minutes(10);
        h.ledger.insert(stale).unwrap();
        h.sim
            .seed_order("BUY_S", "BTCUSDT", Side::Buy, 79900.0, 0.000125, crate::types::OrderStatus::New);
        // Holding inventory: runaway must not fire, and the 0.125% distance
        // is under both the stagnation and grid-gap triggers.
        let mut held = Transaction::new_entry("BUY_H", "BTCUSDT", 70000.0, 0.000125, "seed");
        held.transition(TxStatus::Filled, "filled");
        h.ledger.insert(held).unwrap();

        h.controller.on_tick(80400.0, 80401.0).await.unwrap();
        assert!(h.ledger.get("BUY_S").is_some());
    }

    #[tokio::test]
    async fn stagnation_reposition_fires_with_inventory() {
        let h = harness();
        let mut stale = Transaction::new_entry("BUY_S", "BTCUSDT", 79900.0, 0.000125, "seed");
        stale.created_at = chrono::Utc::now() - chrono::Duration::minutes(30);
        h.ledger.insert(stale).unwrap();
        h.sim
            .seed_order("BUY_S", "BTCUSDT", Side::Buy, 79900.0, 0.000125, crate::types::OrderStatus::New);
        let mut held = Transaction::new_entry("BUY_H", "BTCUSDT", 70000.0, 0.000125, "seed");
        held.transition(TxStatus::Filled, "filled");
        h.ledger.insert(held).unwrap();

        h.controller.on_tick(79950.0, 79951.0).await.unwrap();

        assert!(h.ledger.get("BUY_S").is_none());
        let history = h.ledger.history().unwrap();
        assert!(history
            .iter()
            .any(|t| t.id == "BUY_S" && t.notes.contains("stagnation")));
    }
}
