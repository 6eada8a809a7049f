//! Enforces tenant/DAO-subnet boundaries on data, resources, keys, and
//! permissions — Qflow component C4. Every cross-boundary access is gated
//! here; components above this layer never see enough to bypass it.

pub mod error;
pub mod quota;
pub mod state;

pub use error::IsolationError;
pub use quota::{Resource, ResourceAccountant};
pub use state::{IsolationScope, IsolationStateStore, ScopedStateAccess};
