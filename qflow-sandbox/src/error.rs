use thiserror::Error;

/// Errors a sandboxed module invocation can fail with.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox invocation exceeded its wall-clock deadline")]
    Timeout,

    #[error("access denied by tenant/DAO-subnet isolation boundary")]
    IsolationViolation,

    #[error("sandbox invocation exceeded the tenant's linear memory ceiling ({limit_mb} MB)")]
    MemoryExceeded { limit_mb: u64 },

    #[error("sandbox invocation exhausted its instruction/fuel budget ({ceiling} units)")]
    FuelExceeded { ceiling: u64 },

    #[error("module attempted to invoke an import outside the fixed host ABI: {0}")]
    DisallowedImport(String),

    #[error("host-call ceiling exceeded for {call}: {count} > {limit}")]
    HostCallLimitExceeded {
        call: &'static str,
        count: u32,
        limit: u32,
    },

    #[error("sandbox trapped: {0}")]
    Trap(String),

    #[error("module's `run` export returned a malformed result: {0}")]
    BadResult(String),

    #[error("module load error: {0}")]
    LoadError(String),

    #[error("no module registered for action {0:?} in this tenant's registry")]
    UnknownAction(String),
}

impl SandboxError {
    /// None of these are retryable at this layer — the step's own retry
    /// policy decides whether to re-lease, but the sandbox itself never
    /// silently retries an invocation.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Timeout => "Timeout",
            SandboxError::IsolationViolation => "IsolationViolation",
            SandboxError::MemoryExceeded { .. } => "MemoryExceeded",
            SandboxError::FuelExceeded { .. } => "FuelExceeded",
            SandboxError::DisallowedImport(_) => "DisallowedImport",
            SandboxError::HostCallLimitExceeded { .. } => "HostCallLimitExceeded",
            SandboxError::Trap(_) => "Trap",
            SandboxError::BadResult(_) => "BadResult",
            SandboxError::LoadError(_) => "LoadError",
            SandboxError::UnknownAction(_) => "UnknownAction",
        }
    }
}
