//! Integration of an accepted diff into the target branch.
//!
//! - [`Integrator`]: boundary trait (`base_ref` at cycle start, `integrate`
//!   at merge time)
//! - [`BranchLocks`]: per-branch async mutex so concurrent cycles merge
//!   into the same branch one at a time
//! - [`GitIntegrator`]: git implementation using a detached worktree

pub mod git;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use accdd_store::{Changeset, CycleId};
use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::execution::{CallError, Retryable};

pub use git::GitIntegrator;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrationError {
    /// The branch moved since the cycle started and touched the same files.
    #[error("merge conflict on {}", paths.join(", "))]
    Conflict { paths: Vec<String> },

    #[error("integration failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Call(#[from] CallError),
}

impl Retryable for IntegrationError {
    fn is_transient(&self) -> bool {
        matches!(self, IntegrationError::Call(e) if e.is_transient())
    }
}

/// What to merge, and against which starting point.
#[derive(Debug, Clone)]
pub struct MergeRequest<'a> {
    pub cycle_id: &'a CycleId,
    pub branch: &'a str,
    /// Branch head recorded when the cycle started.
    pub base_ref: &'a str,
    pub changeset: &'a Changeset,
    pub message: String,
}

#[async_trait]
pub trait Integrator: Send + Sync {
    /// Current head of `branch`.
    async fn base_ref(&self, branch: &str) -> Result<String, IntegrationError>;

    /// Apply the changeset on top of the branch, returning the new commit.
    async fn integrate(&self, request: &MergeRequest<'_>) -> Result<String, IntegrationError>;
}

/// Named async locks, one per integration branch.
#[derive(Debug, Clone, Default)]
pub struct BranchLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `branch`.
    pub async fn lock(&self, branch: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(branch.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_branch_is_serialized() {
        let locks = BranchLocks::new();
        let guard = locks.lock("main").await;
        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("main").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_branches_do_not_block() {
        let locks = BranchLocks::new();
        let _main = locks.lock("main").await;
        tokio::time::timeout(Duration::from_secs(1), locks.lock("release"))
            .await
            .unwrap();
    }

    #[test]
    fn only_transient_calls_retry() {
        assert!(IntegrationError::Call(CallError::Transient("x".into())).is_transient());
        assert!(!IntegrationError::Conflict { paths: vec![] }.is_transient());
        assert!(!IntegrationError::Failed("x".into()).is_transient());
    }
}
