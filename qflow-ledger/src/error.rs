use qflow_common::ExecId;
use thiserror::Error;

/// Errors the ledger's storage and chain-verification operations can
/// raise.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage I/O error: {0}")]
    StorageIo(String),

    #[error("no ledger entries found for execution {0}")]
    NotFound(ExecId),

    #[error("requested range [{from}, {to}) is not contiguous with the stored chain for {exec_id}")]
    NotContiguous {
        exec_id: ExecId,
        from: u64,
        to: u64,
    },

    #[error("append for execution {0} lost the race against a concurrent writer after exhausting its retry budget")]
    LedgerConflict(ExecId),

    #[error("chain integrity violation for execution {exec_id} at seq {seq}: {detail}")]
    IntegrityViolation {
        exec_id: ExecId,
        seq: u64,
        detail: String,
    },

    #[error("attempted transition not permitted from the current ledger state: {0}")]
    InvalidTransition(String),
}

impl LedgerError {
    /// Fatal errors are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::IntegrityViolation { .. })
    }
}
