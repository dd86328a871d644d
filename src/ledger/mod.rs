//! Persistent transaction ledger and account balance cache.

mod balances;
mod store;
mod transaction;

pub use balances::BalanceCache;
pub use store::LedgerStore;
pub use transaction::{Transaction, TxKind, TxStatus};
