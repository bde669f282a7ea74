//! Git-backed integrator.
//!
//! The changeset is committed from a detached worktree on top of the
//! current branch head, then the branch ref is moved with a compare-and-swap
//! `update-ref`. The caller's checkout is never touched. If the branch moved
//! since the cycle's base and the new commits touched any file in the
//! changeset, the merge is refused as a conflict.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::sandbox::validate_relative_path;

use super::{IntegrationError, Integrator, MergeRequest};

pub struct GitIntegrator {
    repo_dir: PathBuf,
    author_name: String,
    author_email: String,
}

impl GitIntegrator {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            author_name: "ac-cdd".into(),
            author_email: "ac-cdd@localhost".into(),
        }
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, IntegrationError> {
        let output = Command::new("git")
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| IntegrationError::Failed(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IntegrationError::Failed(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn head_of(&self, branch: &str) -> Result<String, IntegrationError> {
        let sha = self
            .git(
                &self.repo_dir,
                &["rev-parse", "--verify", &format!("refs/heads/{branch}^{{commit}}")],
            )
            .await?;
        if sha.is_empty() {
            return Err(IntegrationError::Failed(format!(
                "branch {branch} resolved to nothing"
            )));
        }
        Ok(sha)
    }

    async fn commit_in_worktree(
        &self,
        worktree: &Path,
        head: &str,
        request: &MergeRequest<'_>,
    ) -> Result<String, IntegrationError> {
        let wt = worktree.to_string_lossy().into_owned();
        self.git(&self.repo_dir, &["worktree", "add", "--detach", &wt, head])
            .await?;

        for (path, content) in request.changeset.files.iter() {
            validate_relative_path(path).map_err(|e| IntegrationError::Failed(e.to_string()))?;
            let target = worktree.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| IntegrationError::Failed(format!("create {path}: {e}")))?;
            }
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| IntegrationError::Failed(format!("write {path}: {e}")))?;
        }

        self.git(worktree, &["add", "-A"]).await?;
        self.git(
            worktree,
            &["commit", "--allow-empty", "--no-verify", "-m", &request.message],
        )
        .await?;
        self.git(worktree, &["rev-parse", "HEAD"]).await
    }
}

#[async_trait]
impl Integrator for GitIntegrator {
    async fn base_ref(&self, branch: &str) -> Result<String, IntegrationError> {
        self.head_of(branch).await
    }

    async fn integrate(&self, request: &MergeRequest<'_>) -> Result<String, IntegrationError> {
        let branch = request.branch;
        let head = self.head_of(branch).await?;

        if head != request.base_ref {
            let changed = self
                .git(
                    &self.repo_dir,
                    &["diff", "--name-only", request.base_ref, &head],
                )
                .await?;
            let changed: BTreeSet<&str> = changed.lines().map(str::trim).collect();
            let overlap: Vec<String> = request
                .changeset
                .files
                .paths()
                .filter(|p| changed.contains(p))
                .map(str::to_string)
                .collect();
            if !overlap.is_empty() {
                return Err(IntegrationError::Conflict { paths: overlap });
            }
            debug!(branch, base = %request.base_ref, head = %head, "branch moved without overlap");
        }

        let scratch = tempfile::tempdir()
            .map_err(|e| IntegrationError::Failed(format!("create worktree dir: {e}")))?;
        let worktree = scratch.path().join("worktree");
        let committed = self.commit_in_worktree(&worktree, &head, request).await;

        let wt = worktree.to_string_lossy().into_owned();
        if let Err(e) = self
            .git(&self.repo_dir, &["worktree", "remove", "--force", &wt])
            .await
        {
            warn!(error = %e, "failed to remove integration worktree");
        }
        let commit = committed?;

        // Fails if the branch moved while we were committing.
        self.git(
            &self.repo_dir,
            &["update-ref", &format!("refs/heads/{branch}"), &commit, &head],
        )
        .await
        .map_err(|_| IntegrationError::Conflict {
            paths: vec![format!("refs/heads/{branch}")],
        })?;

        info!(cycle_id = %request.cycle_id, branch, commit = %commit, "changeset integrated");
        Ok(commit)
    }
}
