//! Error kinds shared across crates that are not owned by any single
//! component.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("key not found")]
    NotFound,
    #[error("atomic batch commit failed: {0}")]
    BatchFailed(String),
}
