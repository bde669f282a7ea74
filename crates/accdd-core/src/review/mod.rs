//! Reviewers of a cycle's diff: committee auditors and the QA analyst.

pub mod command;

use accdd_store::{Changeset, ContentDigest, CycleId, CycleInputs, UatVerdict};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::execution::CallError;

pub use command::{CommandAuditor, CommandQaAnalyst};

/// Everything an auditor sees for one review.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewContext<'a> {
    pub cycle_id: &'a CycleId,
    pub iteration: u32,
    pub position: usize,
    /// 1-based review count at this position, including this one.
    pub attempt_number: u32,
    pub diff_digest: &'a ContentDigest,
    pub changeset: &'a Changeset,
    pub inputs: &'a CycleInputs,
    pub test_log: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default)]
    pub critical_issues: Vec<String>,
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            critical_issues: Vec::new(),
        }
    }

    pub fn reject(issues: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            approved: false,
            critical_issues: issues.into_iter().map(Into::into).collect(),
        }
    }
}

/// One seat on the audit committee.
#[async_trait]
pub trait CommitteeAuditor: Send + Sync {
    fn name(&self) -> &str;

    async fn review(&self, ctx: &ReviewContext<'_>) -> Result<ReviewDecision, CallError>;
}

/// Judges test output against the acceptance scenarios.
#[async_trait]
pub trait QaAnalyst: Send + Sync {
    async fn evaluate(
        &self,
        test_log: &str,
        acceptance_scenarios: &str,
    ) -> Result<UatVerdict, CallError>;
}
