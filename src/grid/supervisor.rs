//! Supervisor: wires the components, owns their lifecycles, and drives the
//! tick and scheduler loops.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::exchange::Exchange;
use crate::grid::breaker::CircuitBreaker;
use crate::grid::config::AppConfig;
use crate::grid::controller::GridController;
use crate::grid::ingest::EventIngestor;
use crate::grid::notify::{MetricsSink, Notifier};
use crate::grid::pipeline::OrderPipeline;
use crate::grid::reconcile::Reconciler;
use crate::grid::volatility::VolatilityEstimator;
use crate::ledger::{BalanceCache, LedgerStore, TxKind, TxStatus};
use crate::ws::{MarketStream, UserStream};

/// Periodic reconciliation cadence.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Account balance refresh cadence.
const BALANCE_SYNC_INTERVAL: Duration = Duration::from_secs(60);

pub struct Supervisor {
    config: AppConfig,
    config_path: Option<PathBuf>,
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsSink>,
}

impl Supervisor {
    pub fn new(
        config: AppConfig,
        config_path: Option<PathBuf>,
        exchange: Arc<dyn Exchange>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            config_path,
            exchange,
            notifier,
            metrics,
        }
    }

    /// Bootstrap and run until shutdown.
    ///
    /// Startup order: ledger load and closed-row sweep, symbol filters,
    /// balance snapshot, full reconciliation, then streams and loops.
    pub async fn run(self) -> Result<()> {
        let cfg = &self.config;
        let symbol = cfg.grid.symbol.clone();

        let ledger = Arc::new(LedgerStore::new(
            &cfg.ledger.active_file,
            &cfg.ledger.history_file,
        ));
        ledger.load()?;
        let swept = ledger.cleanup_closed()?;
        if swept > 0 {
            info!(count = swept, "Archived leftover closed transactions at startup");
        }

        let filters = self.exchange.exchange_filters(&symbol).await?;
        info!(
            symbol = %symbol,
            tick_size = filters.tick_size,
            step_size = filters.step_size,
            min_notional = filters.min_notional,
            "Symbol filters loaded"
        );

        let balances = Arc::new(BalanceCache::new());
        match self.exchange.account_info().await {
            Ok(account) => balances.apply_account(&account),
            Err(e) => warn!(error = %e, "Initial balance fetch failed"),
        }

        let volatility = Arc::new(VolatilityEstimator::new(
            self.exchange.clone(),
            &symbol,
            cfg.volatility.clone(),
        ));
        let pipeline = Arc::new(OrderPipeline::new(
            self.exchange.clone(),
            ledger.clone(),
            balances.clone(),
            volatility.clone(),
            self.notifier.clone(),
            filters,
            &symbol,
            &cfg.grid.base_asset,
        ));
        let reconciler = Arc::new(Reconciler::new(
            self.exchange.clone(),
            ledger.clone(),
            pipeline.clone(),
            balances.clone(),
            self.notifier.clone(),
            &symbol,
            &cfg.grid.base_asset,
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            self.exchange.clone(),
            self.notifier.clone(),
            &symbol,
            cfg.safety.crash_protection_enabled,
            cfg.safety.max_drop_pct_5m,
            Duration::from_secs(cfg.safety.crash_pause_min.max(0) as u64 * 60),
        ));
        let controller = Arc::new(GridController::new(
            self.exchange.clone(),
            ledger.clone(),
            pipeline.clone(),
            volatility.clone(),
            breaker,
            balances.clone(),
            self.notifier.clone(),
            cfg.grid.clone(),
            cfg.reposition.clone(),
            self.config_path.clone(),
            cfg.safety.pause_buys,
        ));

        log_startup_state(&ledger, &symbol);

        // Stabilize the ledger against the exchange before trading.
        reconciler.startup_pass().await?;

        // Prime the volatility snapshot; the poll loop keeps it fresh.
        if let Err(e) = volatility.refresh().await {
            warn!(error = %e, "Initial volatility refresh failed, using fallback spacing");
        }

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let (user_stream, events_rx) = UserStream::new(self.exchange.clone(), &cfg.exchange.ws_url);
        tokio::spawn(user_stream.run(shutdown_tx.subscribe()));

        let ingestor = EventIngestor::new(ledger.clone(), pipeline.clone(), self.notifier.clone());
        tokio::spawn(ingestor.run(events_rx, shutdown_tx.subscribe()));

        let (market_stream, mut ticks_rx) = MarketStream::new(&cfg.exchange.ws_url, &symbol);
        tokio::spawn(market_stream.run(shutdown_tx.subscribe()));

        tokio::spawn(volatility.clone().run(shutdown_tx.subscribe()));
        tokio::spawn(balance_sync_loop(
            self.exchange.clone(),
            balances.clone(),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(reconcile_loop(reconciler.clone(), shutdown_tx.subscribe()));
        tokio::spawn(hourly_metrics_loop(
            self.metrics.clone(),
            shutdown_tx.subscribe(),
        ));

        info!(symbol = %symbol, "Grid trader running");

        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                tick = ticks_rx.recv() => {
                    match tick {
                        Some(ticker) => {
                            if ticker.symbol != symbol {
                                continue;
                            }
                            if let Err(e) = controller.on_tick(ticker.bid, ticker.ask).await {
                                error!(error = %e, "Tick handling failed");
                            }
                        }
                        None => {
                            warn!("Tick channel closed, shutting down");
                            let _ = shutdown_tx.send(());
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    let _ = shutdown_tx.send(());
                    break;
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        // Give stream tasks a moment to close the listen key.
        tokio::time::sleep(Duration::from_millis(250)).await;
        info!("Grid trader stopped");
        Ok(())
    }
}

/// Startup summary: what the ledger says the grid looks like.
fn log_startup_state(ledger: &LedgerStore, symbol: &str) {
    let mut open_rungs = 0usize;
    let mut inventory_rungs = 0usize;
    let mut inventory_base = 0.0f64;
    let mut lowest = f64::INFINITY;
    let mut highest = 0.0f64;

    for tx in ledger.all() {
        if tx.symbol != symbol || tx.kind != TxKind::Buy {
            continue;
        }
        match tx.status {
            TxStatus::Open => {
                open_rungs += 1;
                lowest = lowest.min(tx.price_f64());
                highest = highest.max(tx.price_f64());
            }
            TxStatus::Filled | TxStatus::WaitingSell => {
                inventory_rungs += 1;
                inventory_base += tx.amount_f64();
            }
            _ => {}
        }
    }
    if open_rungs == 0 {
        lowest = 0.0;
    }

    info!(
        open_rungs,
        inventory_rungs,
        inventory_base,
        grid_low = lowest,
        grid_high = highest,
        "Startup ledger summary"
    );
    if inventory_rungs > 0 {
        info!("Inventory present at startup; reconciliation will pair or retire it");
    }
}

async fn balance_sync_loop(
    exchange: Arc<dyn Exchange>,
    balances: Arc<BalanceCache>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(BALANCE_SYNC_INTERVAL);
    interval.tick().await; // skip the immediate tick; startup already synced
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match exchange.account_info().await {
                    Ok(account) => balances.apply_account(&account),
                    Err(e) => warn!(error = %e, "Balance sync failed"),
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

async fn reconcile_loop(reconciler: Arc<Reconciler>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
    interval.tick().await; // the startup pass already ran
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = reconciler.periodic_pass().await {
                    error!(error = %e, "Periodic reconciliation failed");
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

/// Hourly metrics tick, aligned to the top of the hour.
async fn hourly_metrics_loop(metrics: Arc<dyn MetricsSink>, mut shutdown: broadcast::Receiver<()>) {
    let now = Utc::now();
    let seconds_into_hour = (now.minute() * 60 + now.second()) as u64;
    let until_next_hour = Duration::from_secs(3600 - seconds_into_hour.min(3599));

    tokio::select! {
        _ = tokio::time::sleep(until_next_hour) => {}
        _ = shutdown.recv() => return,
    }

    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = interval.tick() => metrics.collect_hourly().await,
            _ = shutdown.recv() => return,
        }
    }
}
