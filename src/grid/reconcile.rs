//! Reconciliation engine.
//!
//! Keeps the local ledger coherent with the exchange's authoritative order
//! book across restarts, dropped stream events, and partial failures. A
//! full five-phase pass runs at startup; the periodic tick repeats the
//! reverse sync and ghost purge:
//!
//! 1. Forward sync: import exchange orders the ledger has never seen.
//! 2. Reverse sync: resolve ledger rows whose orders left the open set,
//!    with smart relinking of surviving exits.
//! 3. Ghost purge: resolve stale exits, vanished entries, and
//!    failed-placement rows.
//! 4. Duplicate purge: drop standalone sell rows shadowing a paired exit.
//! 5. Zombie rescue: re-arm or retire filled entries with no exit.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::grid::notify::{AlertClass, Notifier};
use crate::grid::pipeline::OrderPipeline;
use crate::ledger::{BalanceCache, LedgerStore, Transaction, TxKind, TxStatus};
use crate::types::{format_decimal, OrderResponse, OrderStatus, Side, QTY_EPSILON};

/// Fraction of a rung's quantity that must be free for a zombie to be
/// rescued rather than written off as sold out of band.
const ZOMBIE_BALANCE_RATIO: f64 = 0.99;

pub struct Reconciler {
    exchange: Arc<dyn Exchange>,
    ledger: Arc<LedgerStore>,
    pipeline: Arc<OrderPipeline>,
    balances: Arc<BalanceCache>,
    notifier: Arc<dyn Notifier>,
    symbol: String,
    base_asset: String,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        ledger: Arc<LedgerStore>,
        pipeline: Arc<OrderPipeline>,
        balances: Arc<BalanceCache>,
        notifier: Arc<dyn Notifier>,
        symbol: impl Into<String>,
        base_asset: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            ledger,
            pipeline,
            balances,
            notifier,
            symbol: symbol.into(),
            base_asset: base_asset.into(),
        }
    }

    /// Full five-phase pass, run once at startup.
    pub async fn startup_pass(&self) -> Result<()> {
        info!(target: "grid_trader::reconcile", "Startup reconciliation: full pass");
        if let Ok(account) = self.exchange.account_info().await {
            self.balances.apply_account(&account);
        }

        let open = self.exchange.open_orders(&self.symbol).await?;
        self.forward_sync(&open)?;
        self.reverse_sync(&open).await?;

        // Phase 2 may have placed or adopted exits; work from fresh state.
        let open = self.exchange.open_orders(&self.symbol).await?;
        self.ghost_purge(&open).await?;
        self.duplicate_purge()?;
        self.zombie_rescue().await?;
        info!(target: "grid_trader::reconcile", "Startup reconciliation complete");
        Ok(())
    }

    /// Periodic pass: reverse sync plus ghost purge.
    pub async fn periodic_pass(&self) -> Result<()> {
        debug!(target: "grid_trader::reconcile", "Periodic reconciliation");
        let open = self.exchange.open_orders(&self.symbol).await?;
        self.reverse_sync(&open).await?;
        let open = self.exchange.open_orders(&self.symbol).await?;
        self.ghost_purge(&open).await?;
        Ok(())
    }

    /// Phase 1: exchange -> ledger. Orders the ledger knows neither as an
    /// entry nor as an attached exit are imported as orphans.
    fn forward_sync(&self, open: &[OrderResponse]) -> Result<()> {
        for order in open {
            let id = order.client_order_id.as_str();
            if self.ledger.get(id).is_some() || self.ledger.get_by_sell_id(id).is_some() {
                continue;
            }

            let kind = match order.side {
                Side::Buy => TxKind::Buy,
                Side::Sell => TxKind::Sell,
            };
            let tx = Transaction::imported(
                id,
                &self.symbol,
                kind,
                order.price_f64(),
                order.orig_qty_f64(),
            );
            warn!(
                target: "grid_trader::reconcile",
                id,
                side = ?order.side,
                price = %order.price,
                qty = %order.orig_qty,
                "Orphan exchange order imported into ledger"
            );
            self.ledger.insert(tx)?;
        }
        Ok(())
    }

    /// Phase 2: ledger -> exchange. Rows whose live order is missing from
    /// the open set get resolved against the order's terminal status.
    async fn reverse_sync(&self, open: &[OrderResponse]) -> Result<()> {
        let open_ids: HashSet<&str> = open
            .iter()
            .map(|o| o.client_order_id.as_str())
            .collect();

        for tx in self.ledger.all() {
            match tx.status {
                TxStatus::Open => {
                    if open_ids.contains(tx.id.as_str()) {
                        continue;
                    }
                    self.resolve_missing_entry(tx, open).await?;
                }
                TxStatus::WaitingSell => {
                    if open_ids.contains(tx.sell_order_id.as_str()) {
                        continue;
                    }
                    self.resolve_missing_exit(tx).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// An `open` row whose order left the exchange's open set.
    async fn resolve_missing_entry(
        &self,
        mut tx: Transaction,
        open: &[OrderResponse],
    ) -> Result<()> {
        let resolved = match self.exchange.query_order(&self.symbol, &tx.id).await {
            Ok(order) => order,
            Err(Error::OrderNotFound) => {
                tx.transition(TxStatus::Closed, "Order unknown to exchange, purged");
                self.ledger.archive_and_remove(&tx)?;
                warn!(target: "grid_trader::reconcile", id = %tx.id, "Ledger row had no exchange order, archived");
                return Ok(());
            }
            Err(e) => {
                // Transient: leave the row for the next pass.
                warn!(target: "grid_trader::reconcile", id = %tx.id, error = %e, "Order query failed, skipping");
                return Ok(());
            }
        };

        if tx.kind == TxKind::Sell {
            // Imported standalone sell: nothing to pair, just settle it.
            if resolved.status.is_terminal() {
                tx.transition(
                    TxStatus::Closed,
                    &format!("Standalone sell {:?} on exchange", resolved.status),
                );
                self.ledger.archive_and_remove(&tx)?;
            }
            return Ok(());
        }

        if resolved.status == OrderStatus::Filled {
            tx.transition(TxStatus::Filled, "Entry filled while offline");
            self.ledger.update(&tx)?;
            info!(target: "grid_trader::reconcile", id = %tx.id, "Offline entry fill recovered");
            self.relink_or_place_exit(tx, open).await?;
        } else if resolved.status.is_dead() {
            tx.transition(
                TxStatus::Closed,
                &format!("Entry {:?} on exchange", resolved.status),
            );
            self.ledger.archive_and_remove(&tx)?;
            info!(target: "grid_trader::reconcile", id = %tx.id, status = ?resolved.status, "Dead entry archived");
        }
        Ok(())
    }

    /// Smart relinking: prefer the exit the ledger already knows, then any
    /// live SELL of exactly the entry's quantity, and only then a fresh
    /// placement.
    async fn relink_or_place_exit(
        &self,
        mut tx: Transaction,
        open: &[OrderResponse],
    ) -> Result<()> {
        if !tx.sell_order_id.is_empty()
            && open
                .iter()
                .any(|o| o.client_order_id == tx.sell_order_id)
        {
            tx.transition(TxStatus::WaitingSell, "Relinked surviving exit order");
            self.ledger.update(&tx)?;
            info!(
                target: "grid_trader::reconcile",
                id = %tx.id,
                sell_order_id = %tx.sell_order_id,
                "Existing exit still live, relinked"
            );
            return Ok(());
        }

        let amount = tx.amount_f64();
        if let Some(candidate) = open.iter().find(|o| {
            o.side == Side::Sell
                && (o.orig_qty_f64() - amount).abs() < QTY_EPSILON
                && self.ledger.get_by_sell_id(&o.client_order_id).is_none()
        }) {
            tx.attach_exit(&candidate.client_order_id, candidate.price_f64());
            self.ledger.update(&tx)?;
            info!(
                target: "grid_trader::reconcile",
                id = %tx.id,
                sell_order_id = %candidate.client_order_id,
                "Adopted matching live sell as paired exit"
            );
            return Ok(());
        }

        self.pipeline.place_exit(&tx.id).await
    }

    /// A `waiting_sell` row whose exit left the exchange's open set.
    async fn resolve_missing_exit(&self, mut tx: Transaction) -> Result<()> {
        match self
            .exchange
            .query_order(&self.symbol, &tx.sell_order_id)
            .await
        {
            Ok(order) if order.status == OrderStatus::Filled => {
                let profit = tx.realized_profit(tx.sell_price_f64());
                tx.transition(
                    TxStatus::Closed,
                    &format!("Exit filled while offline, profit {}", format_decimal(profit)),
                );
                self.ledger.archive_and_remove(&tx)?;
                info!(
                    target: "grid_trader::reconcile",
                    id = %tx.id,
                    profit,
                    "Offline exit fill recovered, rung archived"
                );
                self.notifier.trade_event(&tx, Some(profit)).await;
                Ok(())
            }
            Ok(order) if order.status.is_dead() => {
                tx.detach_exit(&format!("Exit {:?} on exchange, re-arming", order.status));
                self.ledger.update(&tx)?;
                self.pipeline.place_exit(&tx.id).await
            }
            Ok(_) => Ok(()),
            Err(Error::OrderNotFound) => {
                tx.detach_exit("Exit unknown to exchange, re-arming");
                self.ledger.update(&tx)?;
                self.pipeline.place_exit(&tx.id).await
            }
            Err(e) => {
                warn!(target: "grid_trader::reconcile", id = %tx.id, error = %e, "Exit query failed, skipping");
                Ok(())
            }
        }
    }

    /// Phase 3: ghost purge.
    async fn ghost_purge(&self, open: &[OrderResponse]) -> Result<()> {
        let open_ids: HashSet<&str> = open
            .iter()
            .map(|o| o.client_order_id.as_str())
            .collect();

        for mut tx in self.ledger.all() {
            match tx.status {
                // A filled row that still carries an exit id (crash between
                // attach and status advance).
                TxStatus::Filled if !tx.sell_order_id.is_empty() => {
                    if open_ids.contains(tx.sell_order_id.as_str()) {
                        tx.transition(TxStatus::WaitingSell, "Exit confirmed live during ghost sweep");
                        self.ledger.update(&tx)?;
                        continue;
                    }
                    match self
                        .exchange
                        .query_order(&self.symbol, &tx.sell_order_id)
                        .await
                    {
                        Ok(order) if order.status == OrderStatus::Filled => {
                            let profit = tx.realized_profit(tx.sell_price_f64());
                            tx.transition(
                                TxStatus::Closed,
                                &format!(
                                    "Ghost exit filled, recovered profit {}",
                                    format_decimal(profit)
                                ),
                            );
                            self.ledger.archive_and_remove(&tx)?;
                            self.notifier.trade_event(&tx, Some(profit)).await;
                        }
                        Ok(order) if order.status.is_dead() => {
                            tx.detach_exit("Ghost exit dead, re-arming");
                            self.ledger.update(&tx)?;
                            self.pipeline.place_exit(&tx.id).await?;
                        }
                        Err(Error::OrderNotFound) => {
                            tx.detach_exit("Ghost exit vanished, re-arming");
                            self.ledger.update(&tx)?;
                            self.pipeline.place_exit(&tx.id).await?;
                        }
                        Ok(_) | Err(_) => {}
                    }
                }
                // Open buys that exist nowhere on the exchange.
                TxStatus::Open if !open_ids.contains(tx.id.as_str()) => {
                    if let Err(Error::OrderNotFound) =
                        self.exchange.query_order(&self.symbol, &tx.id).await
                    {
                        tx.transition(TxStatus::Closed, "Ghost entry purged");
                        self.ledger.archive_and_remove(&tx)?;
                        warn!(target: "grid_trader::reconcile", id = %tx.id, "Ghost entry archived");
                    }
                }
                TxStatus::FailedPlacement => {
                    tx.transition(TxStatus::Closed, "Failed placement purged by reconciliation");
                    self.ledger.archive_and_remove(&tx)?;
                    self.notifier
                        .alert(
                            AlertClass::StateInconsistency,
                            &format!("Purged failed-placement row {}", tx.id),
                        )
                        .await;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Phase 4: archive standalone sell rows whose id is already attached
    /// to a buy as its paired exit.
    fn duplicate_purge(&self) -> Result<()> {
        let all = self.ledger.all();
        let attached: HashSet<&str> = all
            .iter()
            .filter(|t| t.kind == TxKind::Buy && !t.sell_order_id.is_empty())
            .map(|t| t.sell_order_id.as_str())
            .collect();

        for mut tx in all.iter().filter(|t| t.kind == TxKind::Sell).cloned() {
            if attached.contains(tx.id.as_str()) {
                tx.transition(TxStatus::Closed, "Duplicate of an attached exit, purged");
                self.ledger.archive_and_remove(&tx)?;
                info!(target: "grid_trader::reconcile", id = %tx.id, "Duplicate sell row purged");
            }
        }
        Ok(())
    }

    /// Phase 5: filled buys with no exit. When the base balance still
    /// covers the rung, re-arm an exit; otherwise the inventory was sold
    /// out of band and the rung is retired.
    async fn zombie_rescue(&self) -> Result<()> {
        for mut tx in self.ledger.all() {
            if tx.kind != TxKind::Buy
                || tx.status != TxStatus::Filled
                || !tx.sell_order_id.is_empty()
            {
                continue;
            }

            let free = self.balances.free(&self.base_asset);
            if free >= tx.amount_f64() * ZOMBIE_BALANCE_RATIO {
                info!(target: "grid_trader::reconcile", id = %tx.id, "Zombie buy rescued, placing exit");
                self.pipeline.place_exit(&tx.id).await?;
            } else {
                tx.transition(TxStatus::Closed, "Insufficient Balance - Assumed Sold");
                self.ledger.archive_and_remove(&tx)?;
                warn!(
                    target: "grid_trader::reconcile",
                    id = %tx.id,
                    free,
                    amount = %tx.amount,
                    "Zombie buy written off, balance below rung size"
                );
                self.notifier
                    .alert(
                        AlertClass::StateInconsistency,
                        &format!("Zombie buy {} assumed sold out of band", tx.id),
                    )
                    .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
    use crate::grid::config::VolatilitySettings;
    use crate::grid::notify::LogNotifier;
    use crate::grid::volatility::VolatilityEstimator;
    use crate::types::SymbolFilters;
    use tempfile::TempDir;

    struct Harness {
        sim: Arc<SimExchange>,
        ledger: Arc<LedgerStore>,
        balances: Arc<BalanceCache>,
        reconciler: Reconciler,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let sim = Arc::new(SimExchange::new());
        sim.set_balance("BTC", 1.0);
        sim.set_balance("USDT", 1000.0);
        let ledger = Arc::new(LedgerStore::new(
            dir.path().join("transactions.json"),
            dir.path().join("history.json"),
        ));
        ledger.load().unwrap();
        let balances = Arc::new(BalanceCache::new());
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new());
        let pipeline = Arc::new(OrderPipeline::new(
            sim.clone(),
            ledger.clone(),
            balances.clone(),
            Arc::new(VolatilityEstimator::new(
                sim.clone(),
                "BTCUSDT",
                VolatilitySettings::default(),
            )),
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
        let reconciler = Reconciler::new(
            sim.clone(),
            ledger.clone(),
            pipeline,
            balances.clone(),
            notifier,
            "BTCUSDT",
            "BTC",
        );
        Harness {
            sim,
            ledger,
            balances,
            reconciler,
            _dir: dir,
        }
    }

    fn seeded_entry(h: &Harness, id: &str, status: TxStatus) -> Transaction {
        let mut tx = Transaction::new_entry(id, "BTCUSDT", 80000.0, 0.000125, "test rung");
        if status != TxStatus::Open {
            tx.transition(status, "seeded");
        }
        h.ledger.insert(tx.clone()).unwrap();
        h.ledger.get(id).unwrap()
    }

    #[tokio::test]
    async fn forward_sync_imports_orphans() {
        let h = harness();
        h.sim
            .seed_order("MANUAL_1", "BTCUSDT", Side::Buy, 79000.0, 0.0002, OrderStatus::New);

        h.reconciler.startup_pass().await.unwrap();

        let imported = h.ledger.get("MANUAL_1").unwrap();
        assert_eq!(imported.status, TxStatus::Open);
        assert_eq!(imported.kind, TxKind::Buy);
        assert!(imported.notes.contains("Imported"));
    }

    #[tokio::test]
    async fn forward_sync_skips_known_exit_ids() {
        let h = harness();
        let mut tx = seeded_entry(&h, "BUY_K", TxStatus::Filled);
        tx.attach_exit("SELL_K", 80400.0);
        h.ledger.update(&tx).unwrap();
        h.sim
            .seed_order("SELL_K", "BTCUSDT", Side::Sell, 80400.0, 0.000125, OrderStatus::New);

        h.reconciler.startup_pass().await.unwrap();
        // The live sell is the attached exit, not an orphan.
        assert!(h.ledger.get("SELL_K").is_none());
        assert_eq!(h.ledger.get("BUY_K").unwrap().status, TxStatus::WaitingSell);
    }

    #[tokio::test]
    async fn reverse_sync_recovers_offline_entry_fill() {
        let h = harness();
        seeded_entry(&h, "BUY_F", TxStatus::Open);
        h.sim
            .seed_order("BUY_F", "BTCUSDT", Side::Buy, 80000.0, 0.000125, OrderStatus::Filled);

        h.reconciler.startup_pass().await.unwrap();

        let after = h.ledger.get("BUY_F").unwrap();
        // Filled offline, no surviving exit: a fresh one was placed.
        assert_eq!(after.status, TxStatus::WaitingSell);
        assert!(!after.sell_order_id.is_empty());
    }

    #[tokio::test]
    async fn reverse_sync_relinks_surviving_exit() {
        let h = harness();
        let mut tx = seeded_entry(&h, "BUY_R", TxStatus::Open);
        tx.sell_order_id = "SELL_R".to_string();
        tx.sell_price = "80400".to_string();
        h.ledger.update(&tx).unwrap();
        h.sim
            .seed_order("BUY_R", "BTCUSDT", Side::Buy, 80000.0, 0.000125, OrderStatus::Filled);
        h.sim
            .seed_order("SELL_R", "BTCUSDT", Side::Sell, 80400.0, 0.000125, OrderStatus::New);

        h.reconciler.startup_pass().await.unwrap();

        let after = h.ledger.get("BUY_R").unwrap();
        assert_eq!(after.status, TxStatus::WaitingSell);
        assert_eq!(after.sell_order_id, "SELL_R");
        // No new sell was submitted.
        assert!(h.sim.placed_requests().is_empty());
    }

    #[tokio::test]
    async fn reverse_sync_adopts_sell_of_matching_quantity() {
        let h = harness();
        seeded_entry(&h, "BUY_A", TxStatus::Open);
        h.sim
            .seed_order("BUY_A", "BTCUSDT", Side::Buy, 80000.0, 0.000125, OrderStatus::Filled);
        // A live SELL with exactly the rung quantity but unknown id.
        h.sim
            .seed_order("SELL_X", "BTCUSDT", Side::Sell, 80500.0, 0.000125, OrderStatus::New);

        h.reconciler.startup_pass().await.unwrap();

        let after = h.ledger.get("BUY_A").unwrap();
        assert_eq!(after.status, TxStatus::WaitingSell);
        assert_eq!(after.sell_order_id, "SELL_X");
        assert!(h.sim.placed_requests().is_empty());
    }

    #[tokio::test]
    async fn reverse_sync_archives_dead_entries() {
        let h = harness();
        seeded_entry(&h, "BUY_D", TxStatus::Open);
        h.sim
            .seed_order("BUY_D", "BTCUSDT", Side::Buy, 80000.0, 0.000125, OrderStatus::Canceled);

        h.reconciler.startup_pass().await.unwrap();

        assert!(h.ledger.get("BUY_D").is_none());
        let history = h.ledger.history().unwrap();
        assert_eq!(history[0].status, TxStatus::Closed);
    }

    #[tokio::test]
    async fn ghost_sweep_archives_filled_exit_without_replacing() {
        // Scenario: before restart one waiting_sell row; during downtime the
        // exit filled. The sweep archives with profit and places nothing.
        let h = harness();
        let mut tx = seeded_entry(&h, "BUY_G", TxStatus::Filled);
        tx.attach_exit("SELL_G", 80400.0);
        h.ledger.update(&tx).unwrap();
        h.sim
            .seed_order("SELL_G", "BTCUSDT", Side::Sell, 80400.0, 0.000125, OrderStatus::Filled);

        h.reconciler.startup_pass().await.unwrap();

        assert!(h.ledger.get("BUY_G").is_none());
        let history = h.ledger.history().unwrap();
        let archived = history.iter().find(|t| t.id == "BUY_G").unwrap();
        assert!(archived.notes.contains("profit 0.05"));
        assert!(h.sim.placed_requests().is_empty());
    }

    #[tokio::test]
    async fn ghost_sweep_purges_vanished_entries() {
        let h = harness();
        seeded_entry(&h, "BUY_V", TxStatus::Open);
        // No such order on the exchange at all.

        h.reconciler.startup_pass().await.unwrap();

        assert!(h.ledger.get("BUY_V").is_none());
        let history = h.ledger.history().unwrap();
        assert!(history.iter().any(|t| t.id == "BUY_V"));
    }

    #[tokio::test]
    async fn failed_placement_rows_are_always_purged() {
        let h = harness();
        seeded_entry(&h, "BUY_FP", TxStatus::FailedPlacement);

        h.reconciler.startup_pass().await.unwrap();

        assert!(h.ledger.get("BUY_FP").is_none());
    }

    #[tokio::test]
    async fn duplicate_sell_rows_are_purged() {
        let h = harness();
        let mut buy = seeded_entry(&h, "BUY_P", TxStatus::Filled);
        buy.attach_exit("SELL_P", 80400.0);
        h.ledger.update(&buy).unwrap();
        h.sim
            .seed_order("SELL_P", "BTCUSDT", Side::Sell, 80400.0, 0.000125, OrderStatus::New);

        // A standalone sell row with the exit's own id.
        let mut dup = Transaction::new_entry("SELL_P", "BTCUSDT", 80400.0, 0.000125, "legacy");
        dup.kind = TxKind::Sell;
        h.ledger.insert(dup).unwrap();

        h.reconciler.startup_pass().await.unwrap();

        assert!(h.ledger.get("SELL_P").is_none());
        assert_eq!(h.ledger.get("BUY_P").unwrap().status, TxStatus::WaitingSell);
    }

    #[tokio::test]
    async fn zombie_with_balance_gets_new_exit() {
        let h = harness();
        seeded_entry(&h, "BUY_Z", TxStatus::Filled);
        h.balances.set_free("BTC", 0.000125);
        // Simulator agrees with the cache.
        h.sim.set_balance("BTC", 0.000125);

        h.reconciler.startup_pass().await.unwrap();

        let after = h.ledger.get("BUY_Z").unwrap();
        assert_eq!(after.status, TxStatus::WaitingSell);
    }

    #[tokio::test]
    async fn zombie_without_balance_is_written_off() {
        // Amount 0.00010 but only 0.00009 free: below the 99% rescue bar.
        let h = harness();
        let tx = Transaction::new_entry("BUY_W", "BTCUSDT", 80000.0, 0.0001, "test rung");
        let mut tx = tx;
        tx.transition(TxStatus::Filled, "seeded");
        h.ledger.insert(tx).unwrap();
        h.sim.set_balance("BTC", 0.00009);

        h.reconciler.startup_pass().await.unwrap();

        assert!(h.ledger.get("BUY_W").is_none());
        let history = h.ledger.history().unwrap();
        let archived = history.iter().find(|t| t.id == "BUY_W").unwrap();
        assert!(archived.notes.contains("Insufficient Balance"));
        assert!(archived.notes.contains("Assumed Sold"));
        assert!(h.sim.placed_requests().is_empty());
    }
}
