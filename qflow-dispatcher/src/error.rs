use qflow_common::{NodeId, StepId};
use thiserror::Error;

/// Dispatcher failure taxonomy.
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("no eligible node for step {0}")]
    NoEligibleNode(StepId),

    #[error("lease for step {step} on node {node} has expired")]
    LeaseExpired { step: StepId, node: NodeId },

    #[error("node {0} is not registered")]
    UnknownNode(NodeId),

    #[error("node {node} already holds an active lease for step {step}")]
    AlreadyLeased { step: StepId, node: NodeId },
}

impl SchedulingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulingError::NoEligibleNode(_) | SchedulingError::LeaseExpired { .. })
    }
}
