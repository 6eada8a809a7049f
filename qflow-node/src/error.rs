//! Aggregates every component's typed errors into one result type for the
//! engine facade.

use qflow_common::{ExecId, FlowId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QflowError {
    #[error(transparent)]
    Ledger(#[from] qflow_ledger::LedgerError),

    #[error(transparent)]
    Sandbox(#[from] qflow_sandbox::SandboxError),

    #[error(transparent)]
    Validation(#[from] qflow_validation::ValidationError),

    #[error(transparent)]
    Isolation(#[from] qflow_isolation::IsolationError),

    #[error(transparent)]
    StateMachine(#[from] qflow_state_machine::StateMachineError),

    #[error(transparent)]
    Scheduling(#[from] qflow_dispatcher::SchedulingError),

    #[error(transparent)]
    Coordination(#[from] qflow_coordination::CoordinationError),

    #[error("unknown flow {0}")]
    UnknownFlow(FlowId),

    #[error("unknown execution {0}")]
    UnknownExecution(ExecId),

    #[error("step invocation was cancelled")]
    Cancelled,

    #[error("operation refused: execution {0} is paused")]
    Paused(ExecId),
}

impl QflowError {
    /// Delegates to whichever sub-error's own `is_retryable`/`is_fatal`
    /// predicate actually fired.
    pub fn is_retryable(&self) -> bool {
        match self {
            QflowError::Scheduling(e) => e.is_retryable(),
            QflowError::Validation(e) => e.is_retryable(),
            _ => false,
        }
    }
}
