//! Event ingestion from the user-data stream.
//!
//! Single consumer: execution reports apply in arrival order, and every
//! handler is idempotent so replayed or duplicated events cannot corrupt
//! the ledger.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::errors::Result;
use crate::grid::notify::Notifier;
use crate::grid::pipeline::OrderPipeline;
use crate::ledger::{LedgerStore, Transaction, TxStatus};
use crate::types::{format_decimal, OrderStatus};
use crate::ws::ExecutionReport;

pub struct EventIngestor {
    ledger: Arc<LedgerStore>,
    pipeline: Arc<OrderPipeline>,
    notifier: Arc<dyn Notifier>,
}

impl EventIngestor {
    pub fn new(
        ledger: Arc<LedgerStore>,
        pipeline: Arc<OrderPipeline>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            ledger,
            pipeline,
            notifier,
        }
    }

    /// Consume execution reports until the channel closes or shutdown fires.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ExecutionReport>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(report) => {
                            if let Err(e) = self.apply(&report).await {
                                error!(
                                    target: "grid_trader::ingest",
                                    error = %e,
                                    client_order_id = %report.client_order_id,
                                    "Failed to apply execution report"
                                );
                            }
                        }
                        None => return,
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Apply one execution report to the ledger.
    pub async fn apply(&self, report: &ExecutionReport) -> Result<()> {
        let client_id = report.effective_client_id();

        if let Some(tx) = self.ledger.get(client_id) {
            return self.apply_to_entry(tx, report).await;
        }
        if let Some(tx) = self.ledger.get_by_sell_id(client_id) {
            return self.apply_to_exit(tx, report).await;
        }

        debug!(
            target: "grid_trader::ingest",
            client_order_id = %client_id,
            status = ?report.status,
            "Execution report for unknown order, ignoring"
        );
        Ok(())
    }

    /// Report matched the entry order of a rung.
    async fn apply_to_entry(&self, mut tx: Transaction, report: &ExecutionReport) -> Result<()> {
        match report.status {
            OrderStatus::Filled => {
                // Duplicate delivery: the exit is already armed or placed.
                if !tx.sell_order_id.is_empty() || tx.status != TxStatus::Open {
                    debug!(
                        target: "grid_trader::ingest",
                        id = %tx.id,
                        "Duplicate fill report, skipping"
                    );
                    return Ok(());
                }

                let exec_price = report.last_exec_price_f64();
                let cum_qty = report.cum_qty_f64();
                if exec_price > 0.0 {
                    tx.price = format_decimal(exec_price);
                }
                if cum_qty > 0.0 {
                    tx.amount = format_decimal(cum_qty);
                }
                tx.transition(TxStatus::Filled, "Entry filled");
                self.ledger.update(&tx)?;
                info!(
                    target: "grid_trader::ingest",
                    id = %tx.id,
                    price = %tx.price,
                    amount = %tx.amount,
                    "Entry filled, arming exit"
                );
                self.notifier.trade_event(&tx, None).await;

                self.pipeline.place_exit(&tx.id).await
            }
            status if status.is_dead() => {
                if tx.status != TxStatus::Open {
                    return Ok(());
                }
                tx.transition(TxStatus::Closed, &format!("Entry {status:?} on exchange"));
                self.ledger.archive_and_remove(&tx)?;
                info!(
                    target: "grid_trader::ingest",
                    id = %tx.id,
                    status = ?status,
                    "Entry order terminated, rung archived"
                );
                Ok(())
            }
            _ => {
                debug!(
                    target: "grid_trader::ingest",
                    id = %tx.id,
                    status = ?report.status,
                    "Entry order progress report"
                );
                Ok(())
            }
        }
    }

    /// Report matched the paired exit of a rung.
    async fn apply_to_exit(&self, mut tx: Transaction, report: &ExecutionReport) -> Result<()> {
        match report.status {
            OrderStatus::Filled => {
                let sell_price = if report.last_exec_price_f64() > 0.0 {
                    report.last_exec_price_f64()
                } else {
                    tx.sell_price_f64()
                };
                let profit = tx.realized_profit(sell_price);
                tx.transition(
                    TxStatus::Closed,
                    &format!("Exit filled, profit {}", format_decimal(profit)),
                );
                self.ledger.archive_and_remove(&tx)?;
                info!(
                    target: "grid_trader::ingest",
                    id = %tx.id,
                    sell_order_id = %tx.sell_order_id,
                    profit,
                    "Round trip complete, rung archived"
                );
                self.notifier.trade_event(&tx, Some(profit)).await;
                Ok(())
            }
            status if status.is_dead() => {
                // Exit lost while the inventory remains: re-arm.
                tx.detach_exit(&format!("Exit {status:?} externally, re-arming"));
                self.ledger.update(&tx)?;
                info!(
                    target: "grid_trader::ingest",
                    id = %tx.id,
                    status = ?status,
                    "Paired exit lost, replacing"
                );
                self.pipeline.place_exit(&tx.id).await
            }
            _ => Ok(()),
        }
    }
}
