//! The ledger entity: one grid rung's lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::format_decimal;

/// Transaction kind. The ledger primarily stores entries (`buy`); a `sell`
/// row only appears as a reconciliation import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Buy,
    Sell,
}

/// Transaction state machine label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Entry order is live on the exchange
    Open,
    /// Entry executed; no paired exit posted yet
    Filled,
    /// Paired exit is live on the exchange
    WaitingSell,
    /// Terminal; candidate for archival
    Closed,
    /// Exit could not be placed after exhausting retries
    FailedPlacement,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Closed)
    }

    /// States that hold base-asset inventory.
    pub fn is_inventory(&self) -> bool {
        matches!(self, TxStatus::Filled | TxStatus::WaitingSell)
    }
}

/// One grid rung: a buy-side entry and, when filled, its paired sell-side
/// exit attached via `sell_order_id`.
///
/// Quantities and prices are persisted as decimal strings; in-core math is
/// f64 with tick/step quantization at the exchange boundary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Transaction {
    pub id: String,
    pub exchange: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: TxKind,
    pub amount: String,
    pub price: String,
    #[serde(default)]
    pub fee: String,
    pub status: TxStatus,
    #[serde(default)]
    pub sell_order_id: String,
    #[serde(default)]
    pub sell_price: String,
    #[serde(default)]
    pub sell_created_at: Option<DateTime<Utc>>,
    pub notes: String,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// New buy-side entry in `open` state.
    pub fn new_entry(
        id: impl Into<String>,
        symbol: impl Into<String>,
        price: f64,
        quantity: f64,
        note: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Transaction {
            id: id.into(),
            exchange: "binance".to_string(),
            symbol: symbol.into(),
            kind: TxKind::Buy,
            amount: format_decimal(quantity),
            price: format_decimal(price),
            fee: "0".to_string(),
            status: TxStatus::Open,
            sell_order_id: String::new(),
            sell_price: String::new(),
            sell_created_at: None,
            notes: note.into(),
            closed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Orphan imported from the exchange's open-order set.
    pub fn imported(
        id: impl Into<String>,
        symbol: impl Into<String>,
        kind: TxKind,
        price: f64,
        quantity: f64,
    ) -> Self {
        let mut tx = Self::new_entry(id, symbol, price, quantity, "Imported by reconciliation");
        tx.kind = kind;
        tx
    }

    pub fn amount_f64(&self) -> f64 {
        self.amount.parse().unwrap_or(0.0)
    }

    pub fn price_f64(&self) -> f64 {
        self.price.parse().unwrap_or(0.0)
    }

    pub fn sell_price_f64(&self) -> f64 {
        self.sell_price.parse().unwrap_or(0.0)
    }

    /// Apply a state transition: appends `note` to the audit trail, stamps
    /// `updated_at`, and stamps `closed_at` exactly on entry to `closed`.
    pub fn transition(&mut self, status: TxStatus, note: &str) {
        self.status = status;
        self.push_note(note);
        if status == TxStatus::Closed && self.closed_at.is_none() {
            self.closed_at = Some(Utc::now());
        }
    }

    /// Append to the audit trail without changing status.
    pub fn push_note(&mut self, note: &str) {
        if !note.is_empty() {
            if self.notes.is_empty() {
                self.notes = note.to_string();
            } else {
                self.notes = format!("{} | {}", self.notes, note);
            }
        }
        self.updated_at = Utc::now();
    }

    /// Attach a live paired exit and move to `waiting_sell`.
    pub fn attach_exit(&mut self, sell_order_id: impl Into<String>, sell_price: f64) {
        self.sell_order_id = sell_order_id.into();
        self.sell_price = format_decimal(sell_price);
        self.sell_created_at = Some(Utc::now());
        self.transition(
            TxStatus::WaitingSell,
            &format!("Exit placed @ {}", self.sell_price),
        );
    }

    /// The paired exit is gone; revert to `filled` so a new exit can be armed.
    pub fn detach_exit(&mut self, note: &str) {
        self.sell_order_id = String::new();
        self.sell_price = String::new();
        self.sell_created_at = None;
        self.transition(TxStatus::Filled, note);
    }

    /// Gross realized profit against a sell price.
    pub fn realized_profit(&self, sell_price: f64) -> f64 {
        (sell_price - self.price_f64()) * self.amount_f64()
    }

    /// Age of the entry order.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Transaction {
        Transaction::new_entry("BUY_1", "BTCUSDT", 80000.0, 0.000125, "Grid entry")
    }

    #[test]
    fn transition_stamps_closed_at_exactly_once() {
        let mut tx = entry();
        assert!(tx.closed_at.is_none());
        tx.transition(TxStatus::Closed, "done");
        let first = tx.closed_at.unwrap();
        tx.transition(TxStatus::Closed, "again");
        assert_eq!(tx.closed_at.unwrap(), first);
    }

    #[test]
    fn attach_and_detach_exit() {
        let mut tx = entry();
        tx.transition(TxStatus::Filled, "entry filled");
        tx.attach_exit("SELL_1", 80400.0);
        assert_eq!(tx.status, TxStatus::WaitingSell);
        assert_eq!(tx.sell_order_id, "SELL_1");
        assert!(tx.sell_created_at.is_some());

        tx.detach_exit("exit canceled externally");
        assert_eq!(tx.status, TxStatus::Filled);
        assert!(tx.sell_order_id.is_empty());
        assert!(tx.sell_created_at.is_none());
    }

    #[test]
    fn notes_are_append_only() {
        let mut tx = entry();
        tx.transition(TxStatus::Filled, "entry filled");
        tx.transition(TxStatus::Closed, "archived");
        assert!(tx.notes.contains("Grid entry"));
        assert!(tx.notes.contains("entry filled"));
        assert!(tx.notes.contains("archived"));
    }

    #[test]
    fn realized_profit_is_gross() {
        let tx = entry();
        assert!((tx.realized_profit(80400.0) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn serde_round_trip_preserves_decimal_strings() {
        let tx = entry();
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount, "0.000125");
        assert_eq!(back.price, "80000");
        assert_eq!(back.status, TxStatus::Open);
    }

    #[test]
    fn inventory_classification() {
        assert!(TxStatus::Filled.is_inventory());
        assert!(TxStatus::WaitingSell.is_inventory());
        assert!(!TxStatus::Open.is_inventory());
        assert!(!TxStatus::FailedPlacement.is_inventory());
    }
}
