//! Append-only, hash-chained per-execution event log with atomic commit —
//! Qflow component C1.

pub mod chain;
pub mod error;
pub mod store;

pub use chain::{Ledger, GENESIS_HASH};
pub use error::LedgerError;
pub use store::{LedgerStore, SledLedgerStore};
