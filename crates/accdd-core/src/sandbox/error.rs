//! Error types for the sandbox module.

use crate::execution::CallError;

use super::handle::LifecycleState;

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("provisioning failed: {0}")]
    Provision(CallError),

    #[error("sync of {path} failed: {source}")]
    Sync { path: String, source: CallError },

    #[error("exec failed: {0}")]
    Exec(CallError),

    #[error("sandbox is {state:?}, expected {expected:?}")]
    InvalidState {
        state: LifecycleState,
        expected: LifecycleState,
    },

    #[error("unsafe sandbox path: {0}")]
    UnsafePath(String),
}

impl SandboxError {
    /// Whether the underlying call was interrupted by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SandboxError::Provision(CallError::Cancelled)
                | SandboxError::Exec(CallError::Cancelled)
                | SandboxError::Sync {
                    source: CallError::Cancelled,
                    ..
                }
        )
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
