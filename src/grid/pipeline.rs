//! Order placement pipeline.
//!
//! Entries are post-only with adaptive retry: a rejected maker order is
//! retried at a slightly lower price so placement succeeds even in a
//! falling market. Exits are GTC limit sells one spacing above the entry.
//! Every attempt mints a fresh client order id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::grid::notify::{AlertClass, Notifier};
use crate::grid::volatility::VolatilityEstimator;
use crate::ledger::{BalanceCache, LedgerStore, Transaction, TxStatus};
use crate::types::{format_decimal, OrderRequest, OrderStatus, OrderType, Side, SymbolFilters, TimeInForce};

/// Post-only retry envelope.
const ENTRY_MAX_ATTEMPTS: u32 = 3;
const ENTRY_RETRY_BASE: Duration = Duration::from_millis(200);
const ENTRY_RETRY_STEP: Duration = Duration::from_millis(100);
/// Price concession per retry; well above one tick so the next attempt
/// rests even while the book is falling.
const ENTRY_PRICE_BACKOFF: f64 = 0.0005;
/// Global buy suppression after an exhausted placement.
const BUY_COOLDOWN: Duration = Duration::from_secs(60);

/// Exit retry envelope: exponential backoff from one second.
const EXIT_MAX_ATTEMPTS: u32 = 5;
const EXIT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Haircut absorbing dust and fee-adjusted residuals when sizing exits.
const BALANCE_HAIRCUT: f64 = 0.999;

/// Process-wide sequence keeping client ids unique within a millisecond.
static ORDER_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_client_id(prefix: &str) -> String {
    let seq = ORDER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{seq}", Utc::now().timestamp_millis())
}

pub struct OrderPipeline {
    exchange: Arc<dyn Exchange>,
    ledger: Arc<LedgerStore>,
    balances: Arc<BalanceCache>,
    volatility: Arc<VolatilityEstimator>,
    notifier: Arc<dyn Notifier>,
    filters: SymbolFilters,
    symbol: String,
    base_asset: String,
    buy_cooldown_until: Mutex<Option<Instant>>,
}

impl OrderPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        ledger: Arc<LedgerStore>,
        balances: Arc<BalanceCache>,
        volatility: Arc<VolatilityEstimator>,
        notifier: Arc<dyn Notifier>,
        filters: SymbolFilters,
        symbol: impl Into<String>,
        base_asset: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            ledger,
            balances,
            volatility,
            notifier,
            filters,
            symbol: symbol.into(),
            base_asset: base_asset.into(),
            buy_cooldown_until: Mutex::new(None),
        }
    }

    /// Whether entry placement is suppressed by the anti-ban cooldown.
    pub fn buy_cooldown_active(&self) -> bool {
        self.buy_cooldown_until
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn arm_buy_cooldown(&self) {
        *self
            .buy_cooldown_until
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now() + BUY_COOLDOWN);
    }

    /// Place a post-only limit buy worth `order_value` at or just below
    /// `bid`, retrying with a price concession when the venue reports the
    /// order would cross.
    ///
    /// On success the ledger gains exactly one row; failed attempts leave
    /// no trace. Exhausting the retry budget arms the 60-second buy
    /// cooldown and surfaces a placement-failure alarm.
    pub async fn place_entry(&self, bid: f64, order_value: f64) -> Result<Transaction> {
        let mut price = self.filters.snap_price(bid);

        for attempt in 1..=ENTRY_MAX_ATTEMPTS {
            let qty = self.filters.snap_qty(order_value / price);
            if qty < self.filters.min_qty || !self.filters.meets_notional(price, qty) {
                return Err(Error::OrderRejected(format!(
                    "below exchange minimum: qty={qty} notional={}",
                    price * qty
                )));
            }

            let client_id = next_client_id("BUY");
            let request = OrderRequest {
                symbol: self.symbol.clone(),
                side: Side::Buy,
                order_type: OrderType::LimitMaker,
                time_in_force: None,
                quantity: format_decimal(qty),
                price: Some(format_decimal(price)),
                client_order_id: client_id.clone(),
            };

            match self.exchange.place_order(request).await {
                Ok(resp) if resp.status == OrderStatus::Filled => {
                    // Venue filled the maker order in the create response
                    // (hidden liquidity); pair the exit right away.
                    info!(
                        target: "grid_trader::pipeline",
                        id = %client_id,
                        price,
                        qty,
                        "Entry filled immediately on create"
                    );
                    let mut tx = Transaction::new_entry(
                        &client_id,
                        &self.symbol,
                        resp.avg_fill_price(),
                        qty,
                        "Grid entry (maker)",
                    );
                    tx.transition(TxStatus::Filled, "Filled on create");
                    self.ledger.insert(tx.clone())?;
                    self.notifier.trade_event(&tx, None).await;
                    self.place_exit(&client_id).await?;
                    return self
                        .ledger
                        .get(&client_id)
                        .ok_or_else(|| Error::TransactionNotFound(client_id));
                }
                Ok(_) => {
                    info!(
                        target: "grid_trader::pipeline",
                        id = %client_id,
                        price,
                        qty,
                        attempt,
                        "Maker entry resting"
                    );
                    let tx = Transaction::new_entry(
                        &client_id,
                        &self.symbol,
                        price,
                        qty,
                        "Grid entry (maker)",
                    );
                    self.ledger.insert(tx.clone())?;
                    self.notifier.trade_event(&tx, None).await;
                    return Ok(tx);
                }
                Err(Error::PostOnlyReject) => {
                    warn!(
                        target: "grid_trader::pipeline",
                        price,
                        attempt,
                        "Post-only entry would cross, adapting price"
                    );
                    if attempt < ENTRY_MAX_ATTEMPTS {
                        tokio::time::sleep(ENTRY_RETRY_BASE + ENTRY_RETRY_STEP * attempt).await;
                        price = self.filters.snap_price(price * (1.0 - ENTRY_PRICE_BACKOFF));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.arm_buy_cooldown();
        self.notifier
            .alert(
                AlertClass::PlacementFailure,
                &format!(
                    "Entry placement exhausted {ENTRY_MAX_ATTEMPTS} post-only attempts near {bid}; buys suppressed for {}s",
                    BUY_COOLDOWN.as_secs()
                ),
            )
            .await;
        Err(Error::OrderRejected(
            "post-only placement exhausted retries".to_string(),
        ))
    }

    /// Attach a paired GTC limit sell to a filled entry.
    ///
    /// Exit quantity absorbs dust: the smaller of the entry quantity and
    /// 99.9% of the free base balance. Below the lot minimum the row stays
    /// `filled` and an operational alarm is raised. After five failed
    /// attempts the row moves to `failed_placement`.
    pub async fn place_exit(&self, id: &str) -> Result<()> {
        let mut tx = self
            .ledger
            .get(id)
            .ok_or_else(|| Error::TransactionNotFound(id.to_string()))?;

        if tx.status != TxStatus::Filled || !tx.sell_order_id.is_empty() {
            debug!(
                target: "grid_trader::pipeline",
                id,
                status = ?tx.status,
                "Exit placement skipped, transaction not armed"
            );
            return Ok(());
        }

        // A fill changes the base balance before the minute sync sees it.
        if let Ok(account) = self.exchange.account_info().await {
            self.balances.apply_account(&account);
        }

        let spacing = self.volatility.spacing();
        let target = self.filters.snap_price(tx.price_f64() * (1.0 + spacing));
        let free_base = self.balances.free(&self.base_asset);
        let qty = self
            .filters
            .snap_qty(tx.amount_f64().min(free_base * BALANCE_HAIRCUT));

        if qty < self.filters.min_qty || !self.filters.meets_notional(target, qty) {
            self.notifier
                .alert(
                    AlertClass::LowFunds,
                    &format!(
                        "Exit for {id} below lot minimum (qty={qty}, free {}={free_base}); leaving inventory unpaired",
                        self.base_asset
                    ),
                )
                .await;
            return Ok(());
        }

        for attempt in 1..=EXIT_MAX_ATTEMPTS {
            let client_id = next_client_id("SELL");
            let request = OrderRequest {
                symbol: self.symbol.clone(),
                side: Side::Sell,
                order_type: OrderType::Limit,
                time_in_force: Some(TimeInForce::Gtc),
                quantity: format_decimal(qty),
                price: Some(format_decimal(target)),
                client_order_id: client_id.clone(),
            };

            match self.exchange.place_order(request).await {
                Ok(_) => {
                    tx.attach_exit(&client_id, target);
                    self.ledger.update(&tx)?;
                    info!(
                        target: "grid_trader::pipeline",
                        id,
                        sell_order_id = %client_id,
                        target,
                        qty,
                        spacing,
                        "Paired exit placed"
                    );
                    self.notifier.trade_event(&tx, None).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        target: "grid_trader::pipeline",
                        id,
                        attempt,
                        error = %e,
                        "Exit placement attempt failed"
                    );
                    if attempt < EXIT_MAX_ATTEMPTS {
                        tokio::time::sleep(EXIT_BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
                    }
                }
            }
        }

        tx.transition(
            TxStatus::FailedPlacement,
            "Exit placement failed after retries",
        );
        self.ledger.update(&tx)?;
        self.notifier
            .alert(
                AlertClass::ExitFailure,
                &format!("Could not place paired exit for {id} after {EXIT_MAX_ATTEMPTS} attempts"),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
    use crate::grid::config::VolatilitySettings;
    use crate::grid::notify::LogNotifier;
    use tempfile::TempDir;

    struct Harness {
        sim: Arc<SimExchange>,
        ledger: Arc<LedgerStore>,
        pipeline: OrderPipeline,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let sim = Arc::new(SimExchange::new());
        let ledger = Arc::new(LedgerStore::new(
            dir.path().join("transactions.json"),
            dir.path().join("history.json"),
        ));
        ledger.load().unwrap();
        let balances = Arc::new(BalanceCache::new());
        let volatility = Arc::new(VolatilityEstimator::new(
            sim.clone(),
            "BTCUSDT",
            VolatilitySettings::default(),
        ));
        sim.set_balance("BTC", 1.0);
        sim.set_balance("USDT", 1000.0);
        let filters = SymbolFilters {
            tick_size: 0.01,
            step_size: 0.000001,
            min_qty: 0.000001,
            min_notional: 5.0,
        };
        let pipeline = OrderPipeline::new(
            sim.clone(),
            ledger.clone(),
            balances,
            volatility,
            Arc::new(LogNotifier::new()),
            filters,
            "BTCUSDT",
            "BTC",
        );
        Harness {
            sim,
            ledger,
            pipeline,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn entry_creates_single_open_row() {
        let h = harness();
        let tx = h.pipeline.place_entry(80000.0, 10.0).await.unwrap();
        assert_eq!(tx.status, TxStatus::Open);
        assert_eq!(tx.price, "80000");
        assert_eq!(tx.amount, "0.000125");
        assert_eq!(h.ledger.all().len(), 1);
        assert_eq!(h.sim.placed_requests().len(), 1);
    }

    #[tokio::test]
    async fn post_only_reject_adapts_price_down() {
        let h = harness();
        h.sim.reject_next_post_only(1);
        let tx = h.pipeline.place_entry(80000.0, 10.0).await.unwrap();

        // 80000 * (1 - 0.0005) = 79960.
        assert_eq!(tx.price, "79960");
        assert_eq!(h.ledger.all().len(), 1);
        assert_eq!(h.sim.placed_requests().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_arm_cooldown() {
        let h = harness();
        h.sim.reject_next_post_only(3);
        let err = h.pipeline.place_entry(80000.0, 10.0).await.unwrap_err();
        assert!(matches!(err, Error::OrderRejected(_)));
        assert_eq!(h.sim.placed_requests().len(), 3);
        assert!(h.ledger.all().is_empty());
        assert!(h.pipeline.buy_cooldown_active());
    }

    #[tokio::test]
    async fn refuses_sub_notional_entries() {
        let h = harness();
        let err = h.pipeline.place_entry(80000.0, 1.0).await.unwrap_err();
        assert!(matches!(err, Error::OrderRejected(_)));
        assert!(h.sim.placed_requests().is_empty());
    }

    #[tokio::test]
    async fn immediate_fill_chains_into_exit() {
        let h = harness();
        h.sim.set_fill_on_create(true);
        // The exit sell must rest, not fill.
        let tx = h.pipeline.place_entry(80000.0, 10.0).await.unwrap();

        // Entry is filled and the sim also filled the sell on create, which
        // the pipeline records as waiting_sell regardless.
        assert_eq!(tx.status, TxStatus::WaitingSell);
        assert!(!tx.sell_order_id.is_empty());
        let placed = h.sim.placed_requests();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[1].side, Side::Sell);
    }

    #[tokio::test]
    async fn exit_targets_entry_price_plus_spacing() {
        let h = harness();
        let tx = h.pipeline.place_entry(80000.0, 10.0).await.unwrap();
        let mut filled = h.ledger.get(&tx.id).unwrap();
        filled.transition(TxStatus::Filled, "test fill");
        h.ledger.update(&filled).unwrap();

        h.pipeline.place_exit(&tx.id).await.unwrap();

        let after = h.ledger.get(&tx.id).unwrap();
        assert_eq!(after.status, TxStatus::WaitingSell);
        // Fallback spacing 0.005: 80000 * 1.005 = 80400.
        assert_eq!(after.sell_price, "80400");
        let placed = h.sim.placed_requests();
        let sell = placed.last().unwrap();
        assert_eq!(sell.side, Side::Sell);
        assert_eq!(sell.order_type, OrderType::Limit);
        assert_eq!(sell.time_in_force, Some(TimeInForce::Gtc));
        assert_eq!(sell.price.as_deref(), Some("80400"));
    }

    #[tokio::test]
    async fn exit_skips_rows_that_are_not_armed() {
        let h = harness();
        let tx = h.pipeline.place_entry(80000.0, 10.0).await.unwrap();
        // Still `open`: nothing to pair.
        h.pipeline.place_exit(&tx.id).await.unwrap();
        assert_eq!(h.ledger.get(&tx.id).unwrap().status, TxStatus::Open);
        assert_eq!(h.sim.placed_requests().len(), 1);
    }

    #[tokio::test]
    async fn low_base_balance_leaves_row_filled() {
        let h = harness();
        let tx = h.pipeline.place_entry(80000.0, 10.0).await.unwrap();
        let mut filled = h.ledger.get(&tx.id).unwrap();
        filled.transition(TxStatus::Filled, "test fill");
        h.ledger.update(&filled).unwrap();

        // Free base far below the lot minimum.
        h.sim.set_balance("BTC", 0.000001);
        h.pipeline.place_exit(&tx.id).await.unwrap();

        let after = h.ledger.get(&tx.id).unwrap();
        assert_eq!(after.status, TxStatus::Filled);
        assert!(after.sell_order_id.is_empty());
    }
}
