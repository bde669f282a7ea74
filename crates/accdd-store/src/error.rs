//! Error types for accdd-store

use thiserror::Error;

/// Errors that can occur in the artifact storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested artifact does not exist
    #[error("artifact not found: {what}")]
    NotFound { what: String },

    /// Cycle id is empty or contains characters unsafe for a storage key
    #[error("invalid cycle id: {0:?}")]
    InvalidCycleId(String),

    /// Digest string is not 64 lowercase hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Stored record failed its integrity check
    #[error("digest mismatch for {what}: expected {expected}, got {actual}")]
    DigestMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
