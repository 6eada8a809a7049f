//! Leadership, partition detection, and Byzantine chain verification —
//! Qflow component C7.

pub mod coordinator;
pub mod error;
pub mod leader;

pub use coordinator::{Coordinator, LeaderState};
pub use error::CoordinationError;
pub use leader::{elect_leader, QuorumMember};
