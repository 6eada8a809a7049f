use qflow_common::ExecId;
use thiserror::Error;

/// Coordination failure taxonomy.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("lost the append race for execution {0} past the retry budget")]
    LedgerConflict(ExecId),

    #[error("peer unreachable")]
    PeerUnreachable,

    #[error("this node is not the leader for execution {0}")]
    NotLeader(ExecId),

    #[error("partitioned from the leader for execution {0}")]
    PartitionDetected(ExecId),
}
