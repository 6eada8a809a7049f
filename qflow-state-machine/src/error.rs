use qflow_common::StepId;
use thiserror::Error;

/// State machine failure taxonomy. Any attempt to write a transition not
/// permitted from the current state must fail before ledger append.
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("step {0} is not part of this flow")]
    UnknownStep(StepId),

    #[error("step {step} cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        step: StepId,
        from: qflow_common::StepStatus,
        to: qflow_common::StepStatus,
    },

    #[error("execution is not in a state that permits this operation: {0}")]
    InvalidExecutionState(String),

    #[error("loop {0} exceeded its iteration ceiling")]
    LoopIterationCeilingExceeded(StepId),

    #[error(transparent)]
    Ledger(#[from] qflow_ledger::LedgerError),
}
