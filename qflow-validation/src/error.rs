use thiserror::Error;

/// Validation failure taxonomy.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("decryption failed under key {0:?}")]
    DecryptionFailed(String),

    #[error("identity {identity:?} lacks {action:?} on {resource:?}")]
    PermissionDenied {
        identity: String,
        action: String,
        resource: String,
    },

    #[error("index service unavailable")]
    IndexingUnavailable,

    #[error("signature verification failed for signer {0:?}")]
    IntegrityViolation(String),

    #[error("structural schema violation: {0}")]
    SchemaViolation(String),
}

impl ValidationError {
    /// Only `IndexingUnavailable` is retryable; every other validation
    /// failure is fatal to the payload that triggered it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ValidationError::IndexingUnavailable)
    }
}
