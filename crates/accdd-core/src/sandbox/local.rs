//! Local sandbox provider: one temp directory per sandbox, commands run as
//! child processes with the directory as working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use crate::execution::CallError;

use super::provider::{validate_relative_path, ExecOutput, SandboxId, SandboxProvider};

/// Template name that provisions an empty directory.
pub const EMPTY_TEMPLATE: &str = "empty";

/// Directories never copied out of a template.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

pub struct LocalSandboxProvider {
    root: Option<PathBuf>,
    sandboxes: Mutex<HashMap<SandboxId, TempDir>>,
}

impl LocalSandboxProvider {
    /// Sandboxes are created under `root`, or the system temp dir if `None`.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn dir_of(&self, id: &SandboxId) -> Result<PathBuf, CallError> {
        let sandboxes = self
            .sandboxes
            .lock()
            .map_err(|_| CallError::Fatal("sandbox registry poisoned".into()))?;
        sandboxes
            .get(id)
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| CallError::Fatal(format!("unknown sandbox {id}")))
    }

    /// Number of live sandboxes.
    pub fn live_count(&self) -> usize {
        self.sandboxes.lock().map(|s| s.len()).unwrap_or(0)
    }
}

fn copy_template(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if SKIPPED_DIRS.iter().any(|s| name == *s) {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_template(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn io_fatal(context: &str, e: impl std::fmt::Display) -> CallError {
    CallError::Fatal(format!("{context}: {e}"))
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn provision(&self, template: &str) -> Result<SandboxId, CallError> {
        let dir = match &self.root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| io_fatal("create sandbox root", e))?;
                tempfile::Builder::new().prefix("accdd-").tempdir_in(root)
            }
            None => tempfile::Builder::new().prefix("accdd-").tempdir(),
        }
        .map_err(|e| io_fatal("create sandbox dir", e))?;

        if !template.is_empty() && template != EMPTY_TEMPLATE {
            let from = PathBuf::from(template);
            if !from.is_dir() {
                return Err(CallError::Fatal(format!(
                    "template {template} is not a directory"
                )));
            }
            let to = dir.path().to_path_buf();
            tokio::task::spawn_blocking(move || copy_template(&from, &to))
                .await
                .map_err(|e| io_fatal("template copy task", e))?
                .map_err(|e| io_fatal("copy template", e))?;
        }

        let id = SandboxId::new(format!("local-{}", uuid::Uuid::new_v4()));
        debug!(sandbox_id = %id, path = %dir.path().display(), "local sandbox created");
        self.sandboxes
            .lock()
            .map_err(|_| CallError::Fatal("sandbox registry poisoned".into()))?
            .insert(id.clone(), dir);
        Ok(id)
    }

    async fn upload(&self, id: &SandboxId, path: &str, content: &str) -> Result<(), CallError> {
        validate_relative_path(path).map_err(|e| CallError::Fatal(e.to_string()))?;
        let target = self.dir_of(id)?.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_fatal("create parent dir", e))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| io_fatal("write file", e))
    }

    async fn exec(
        &self,
        id: &SandboxId,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, CallError> {
        let Some((exe, args)) = command.split_first() else {
            return Err(CallError::Fatal("empty command".into()));
        };
        let dir = self.dir_of(id)?;

        let child = Command::new(exe)
            .args(args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io_fatal(&format!("spawn {exe}"), e))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| CallError::Timeout {
                limit_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| io_fatal("wait for command", e))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn destroy(&self, id: &SandboxId) -> Result<(), CallError> {
        let removed = self
            .sandboxes
            .lock()
            .map_err(|_| CallError::Fatal("sandbox registry poisoned".into()))?
            .remove(id);
        match removed {
            Some(dir) => dir.close().map_err(|e| io_fatal("remove sandbox dir", e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_upload_then_exec_sees_file() {
        let provider = LocalSandboxProvider::new(None);
        let id = provider.provision(EMPTY_TEMPLATE).await.unwrap();
        provider.upload(&id, "src/data.txt", "hello").await.unwrap();

        let out = provider
            .exec(&id, &argv(&["cat", "src/data.txt"]), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello");
        provider.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_raised() {
        let provider = LocalSandboxProvider::new(None);
        let id = provider.provision(EMPTY_TEMPLATE).await.unwrap();
        let out = provider
            .exec(&id, &argv(&["sh", "-c", "echo boom >&2; exit 3"]), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stderr.contains("boom"));
        provider.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let provider = LocalSandboxProvider::new(None);
        let id = provider.provision(EMPTY_TEMPLATE).await.unwrap();
        let err = provider
            .exec(&id, &argv(&["sleep", "5"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Timeout { limit_ms: 100 });
        provider.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_template_is_copied_without_git_dir() {
        let template = tempfile::tempdir().unwrap();
        std::fs::write(template.path().join("Cargo.toml"), "[package]").unwrap();
        std::fs::create_dir_all(template.path().join(".git")).unwrap();
        std::fs::write(template.path().join(".git/HEAD"), "ref").unwrap();

        let root = tempfile::tempdir().unwrap();
        let provider = LocalSandboxProvider::new(Some(root.path().to_path_buf()));
        let id = provider
            .provision(template.path().to_str().unwrap())
            .await
            .unwrap();
        let dir = provider.dir_of(&id).unwrap();
        assert!(dir.join("Cargo.toml").exists());
        assert!(!dir.join(".git").exists());

        provider.destroy(&id).await.unwrap();
        assert!(!dir.exists());
        assert_eq!(provider.live_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_rejects_escape() {
        let provider = LocalSandboxProvider::new(None);
        let id = provider.provision(EMPTY_TEMPLATE).await.unwrap();
        assert!(provider.upload(&id, "../outside", "x").await.is_err());
        provider.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let provider = LocalSandboxProvider::new(None);
        let id = provider.provision(EMPTY_TEMPLATE).await.unwrap();
        provider.destroy(&id).await.unwrap();
        provider.destroy(&id).await.unwrap();
    }
}
