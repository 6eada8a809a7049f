//! Shared data model, canonical wire format, and configuration for Qflow.
//!
//! Every other `qflow-*` crate depends on this one for the core types
//! (`Flow`, `Step`, `Execution`, `LedgerEntry`, `NodeRecord`,
//! `TenantContext`) plus the canonical wire encoding used to compute the
//! ledger's chain hash.

pub mod config;
pub mod error;
pub mod model;
pub mod time;
pub mod wire;

pub use model::*;
