//! Error types for lsmidx

use thiserror::Error;

/// Result type alias for lsmidx operations
pub type Result<T> = std::result::Result<T, LsmError>;

/// lsmidx error types
#[derive(Error, Debug)]
pub enum LsmError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Index has no dictionary entry yet (build it first)
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Dictionary entry already exists (double build)
    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    /// Index is still referenced by another handle
    #[error("Index in use: {0}")]
    IndexInUse(String),

    /// Bulk build failed; no dictionary entry was created
    #[error("Build error: {0}")]
    Build(String),

    /// Insert failed; the insert counter was not incremented
    #[error("Insert error: {0}")]
    Insert(String),

    /// Merge failed before the swap; old base/top remain authoritative
    #[error("Merge error: {0}")]
    Merge(String),

    /// Metadata swap write failed; old mapping remains authoritative
    #[error("Swap error: {0}")]
    Swap(String),
}

impl LsmError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, LsmError::Io(_) | LsmError::Merge(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LsmError::Corruption(_) | LsmError::ChecksumMismatch { .. }
        )
    }
}
