use thiserror::Error;

/// Errors raised when an operation crosses the tenant/DAO-subnet boundary
/// or a resource accounting check.
#[derive(Debug, Error)]
pub enum IsolationError {
    /// Deliberately withholds which key/exec it refers to in its Display
    /// text, so a denied cross-scope read can't be distinguished from a
    /// legitimate miss by message alone. Callers needing the key for their
    /// own logging must already have it.
    #[error("access denied by tenant/DAO-subnet isolation boundary")]
    IsolationViolation,

    #[error("resource quota exceeded for {tenant_id}: {resource} ({used} > {limit})")]
    ResourceExceeded {
        tenant_id: String,
        resource: String,
        used: u64,
        limit: u64,
    },

    #[error("key reference {0:?} is not resolvable under the active tenant/DAO subnet")]
    UnresolvableKeyRef(String),
}
