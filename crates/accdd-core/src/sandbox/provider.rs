use std::fmt;
use std::path::{Component, Path};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::execution::CallError;

use super::error::{SandboxError, SandboxResult};

/// Provider-assigned identifier of a live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Captured result of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Combined log as shown to the agent and the QA analyst.
    pub fn combined_log(&self) -> String {
        format!("STDOUT:\n{}\n\nSTDERR:\n{}", self.stdout, self.stderr)
    }
}

/// Host of isolated sandboxes.
///
/// Implementations must make `destroy` idempotent: destroying an id that
/// is already gone is `Ok`.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create a sandbox from `template`.
    async fn provision(&self, template: &str) -> Result<SandboxId, CallError>;

    /// Write one file at a sandbox-relative path, creating parent directories.
    async fn upload(&self, id: &SandboxId, path: &str, content: &str) -> Result<(), CallError>;

    /// Run `command` (argv form) in the sandbox root.
    async fn exec(
        &self,
        id: &SandboxId,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, CallError>;

    async fn destroy(&self, id: &SandboxId) -> Result<(), CallError>;
}

/// Reject absolute paths and any path that climbs out of the sandbox root.
pub fn validate_relative_path(path: &str) -> SandboxResult<()> {
    if path.is_empty() {
        return Err(SandboxError::UnsafePath(path.to_string()));
    }
    let ok = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(SandboxError::UnsafePath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_accepted() {
        for p in ["src/lib.rs", "./Cargo.toml", ".accdd/inputs/SPEC.md"] {
            assert!(validate_relative_path(p).is_ok(), "rejected {p}");
        }
    }

    #[test]
    fn escaping_paths_are_rejected() {
        for p in ["", "/etc/passwd", "../x", "src/../../x"] {
            assert!(validate_relative_path(p).is_err(), "accepted {p}");
        }
    }

    #[test]
    fn combined_log_keeps_both_streams() {
        let out = ExecOutput {
            exit_code: 1,
            stdout: "ran 3 tests".into(),
            stderr: "panicked".into(),
        };
        let log = out.combined_log();
        assert!(log.contains("ran 3 tests"));
        assert!(log.contains("panicked"));
    }
}
