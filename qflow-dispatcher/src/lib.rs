//! Node scoring, lease issuance, and health tracking — Qflow component C6.

pub mod dispatcher;
pub mod error;
pub mod health;
pub mod lease;
pub mod scoring;

pub use dispatcher::{AutoscaleSignal, Dispatcher, NodeRegistry};
pub use error::SchedulingError;
pub use health::NodeEntry;
pub use lease::{Lease, LeaseTable};
pub use scoring::{score_node, SANDBOX_RUNTIME};
