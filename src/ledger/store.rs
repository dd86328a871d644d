//! Persistent store for grid transactions.
//!
//! Two files: an active store holding only non-terminal rows and a history
//! store that is append-only in semantics. The active store always writes a
//! full snapshot under a single mutex; reads hand out defensive copies.
//! Archival writes history first, then the active file, so a failure in
//! between leaves at worst a duplicate in history that the next
//! `cleanup_closed` scan tolerates.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::ledger::{Transaction, TxStatus};

pub struct LedgerStore {
    active_path: PathBuf,
    history_path: PathBuf,
    transactions: Mutex<Vec<Transaction>>,
    history_lock: Mutex<()>,
}

impl LedgerStore {
    pub fn new(active_path: impl Into<PathBuf>, history_path: impl Into<PathBuf>) -> Self {
        Self {
            active_path: active_path.into(),
            history_path: history_path.into(),
            transactions: Mutex::new(Vec::new()),
            history_lock: Mutex::new(()),
        }
    }

    /// Load the active file, creating an empty one when absent.
    pub fn load(&self) -> Result<()> {
        let mut txs = self.lock_active();
        if !self.active_path.exists() {
            info!(path = %self.active_path.display(), "Ledger file not found, creating empty");
            *txs = Vec::new();
            return write_snapshot(&self.active_path, &txs);
        }

        let content = fs::read_to_string(&self.active_path)
            .map_err(|e| Error::Ledger(format!("read {}: {e}", self.active_path.display())))?;
        *txs = serde_json::from_str(&content)
            .map_err(|e| Error::Ledger(format!("parse {}: {e}", self.active_path.display())))?;
        info!(count = txs.len(), "Ledger loaded");
        Ok(())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Vec<Transaction>> {
        self.transactions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a new row. Duplicate ids are refused.
    pub fn insert(&self, tx: Transaction) -> Result<()> {
        let mut txs = self.lock_active();
        if txs.iter().any(|t| t.id == tx.id) {
            return Err(Error::Ledger(format!("duplicate transaction id: {}", tx.id)));
        }
        txs.push(tx);
        write_snapshot(&self.active_path, &txs)
    }

    /// Replace the row with the same id.
    pub fn update(&self, tx: &Transaction) -> Result<()> {
        let mut txs = self.lock_active();
        match txs.iter_mut().find(|t| t.id == tx.id) {
            Some(slot) => {
                *slot = tx.clone();
                write_snapshot(&self.active_path, &txs)
            }
            None => Err(Error::TransactionNotFound(tx.id.clone())),
        }
    }

    pub fn get(&self, id: &str) -> Option<Transaction> {
        self.lock_active().iter().find(|t| t.id == id).cloned()
    }

    pub fn get_by_sell_id(&self, sell_order_id: &str) -> Option<Transaction> {
        if sell_order_id.is_empty() {
            return None;
        }
        self.lock_active()
            .iter()
            .find(|t| t.sell_order_id == sell_order_id)
            .cloned()
    }

    /// Defensive copy of all active rows.
    pub fn all(&self) -> Vec<Transaction> {
        self.lock_active().clone()
    }

    /// Remove a row by id. Missing ids are a no-op.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut txs = self.lock_active();
        let before = txs.len();
        txs.retain(|t| t.id != id);
        if txs.len() == before {
            return Ok(());
        }
        write_snapshot(&self.active_path, &txs)
    }

    /// Append a row to the history file (read-append-write).
    pub fn archive(&self, tx: &Transaction) -> Result<()> {
        let _guard = self.history_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut history = self.read_history_unlocked()?;
        history.push(tx.clone());
        write_snapshot(&self.history_path, &history)
    }

    /// Archive a row and remove it from the active ledger. History is
    /// written first; on active-write failure the history duplicate is
    /// tolerated.
    pub fn archive_and_remove(&self, tx: &Transaction) -> Result<()> {
        self.archive(tx)?;
        self.remove(&tx.id)
    }

    /// Whole history file; used by metrics and tests.
    pub fn history(&self) -> Result<Vec<Transaction>> {
        let _guard = self.history_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_history_unlocked()
    }

    fn read_history_unlocked(&self) -> Result<Vec<Transaction>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.history_path)
            .map_err(|e| Error::Ledger(format!("read {}: {e}", self.history_path.display())))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| Error::Ledger(format!("parse {}: {e}", self.history_path.display())))
    }

    /// Startup sweep: archive any `closed` rows left in the active file and
    /// drop them from the active set. Returns how many were moved.
    pub fn cleanup_closed(&self) -> Result<usize> {
        let mut txs = self.lock_active();
        let (closed, active): (Vec<_>, Vec<_>) =
            txs.drain(..).partition(|t| t.status == TxStatus::Closed);
        *txs = active;

        if closed.is_empty() {
            return Ok(0);
        }
        info!(count = closed.len(), "Archiving closed transactions left in active ledger");

        {
            let _guard = self.history_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut history = self.read_history_unlocked()?;
            // Tolerate duplicates from an earlier interrupted archive.
            for tx in &closed {
                if !history.iter().any(|h| h.id == tx.id && h.closed_at == tx.closed_at) {
                    history.push(tx.clone());
                } else {
                    warn!(id = %tx.id, "Duplicate history row skipped");
                }
            }
            write_snapshot(&self.history_path, &history)?;
        }

        write_snapshot(&self.active_path, &txs)?;
        Ok(closed.len())
    }
}

/// Full-snapshot write with indented, deterministic JSON.
fn write_snapshot(path: &Path, txs: &[Transaction]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Ledger(format!("create {}: {e}", parent.display())))?;
        }
    }
    let json = serde_json::to_string_pretty(txs)
        .map_err(|e| Error::Ledger(format!("serialize: {e}")))?;
    fs::write(path, json).map_err(|e| Error::Ledger(format!("write {}: {e}", path.display())))
}
