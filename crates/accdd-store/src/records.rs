//! Persisted records of a development cycle.
//!
//! These types are the data model shared by the store and the orchestrator:
//! inputs (`CycleInputs`), per-iteration outputs (`Changeset`,
//! `TestRunResult`, `AuditVerdict`, `UatRecord`), the agent session pointer
//! (`SessionManifest`) and the terminal archive (`CycleRecord`).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{ContentDigest, StorageResult};

// ---------------------------------------------------------------------------
// CycleId
// ---------------------------------------------------------------------------

/// Identifier of one cycle. Safe to use as a path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CycleId(String);

impl CycleId {
    /// Validate and wrap a cycle id.
    ///
    /// Accepts 1..=128 characters from `[A-Za-z0-9._-]`, excluding `.` and `..`.
    pub fn new(id: impl Into<String>) -> StorageResult<Self> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if id.is_empty() || id.len() > 128 || !valid_chars || id == "." || id == ".." {
            return Err(StorageError::InvalidCycleId(id));
        }
        Ok(CycleId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CycleId {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        CycleId::new(s)
    }
}

impl From<CycleId> for String {
    fn from(id: CycleId) -> Self {
        id.0
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Static inputs of a cycle, read once at `Init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleInputs {
    pub specification: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub acceptance_scenarios: String,
}

impl CycleInputs {
    /// Sandbox-relative directory the inputs are synced into.
    pub const SANDBOX_DIR: &'static str = ".accdd/inputs";

    /// The inputs as a fileset under [`Self::SANDBOX_DIR`].
    pub fn to_fileset(&self) -> Fileset {
        let mut files = Fileset::new();
        files.insert(
            format!("{}/SPEC.md", Self::SANDBOX_DIR),
            self.specification.clone(),
        );
        if let Some(schema) = &self.schema {
            files.insert(format!("{}/SCHEMA.md", Self::SANDBOX_DIR), schema.clone());
        }
        files.insert(
            format!("{}/UAT.md", Self::SANDBOX_DIR),
            self.acceptance_scenarios.clone(),
        );
        files
    }
}

// ---------------------------------------------------------------------------
// Fileset / Changeset
// ---------------------------------------------------------------------------

/// Relative path → text content. Ordered so the digest is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fileset {
    files: BTreeMap<String, String>,
}

impl Fileset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file, returning the previous content.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) -> Option<String> {
        self.files.insert(path.into(), content.into())
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Digest of a single file's content.
    pub fn file_digest(content: &str) -> ContentDigest {
        ContentDigest::from_bytes(content.as_bytes())
    }

    /// Digest over every (path, content) pair in path order.
    ///
    /// Paths and contents are length-prefixed so no two distinct filesets
    /// share a byte stream.
    pub fn digest(&self) -> ContentDigest {
        let mut buf = Vec::new();
        for (path, content) in &self.files {
            buf.extend_from_slice(&(path.len() as u64).to_le_bytes());
            buf.extend_from_slice(path.as_bytes());
            buf.extend_from_slice(&(content.len() as u64).to_le_bytes());
            buf.extend_from_slice(content.as_bytes());
        }
        ContentDigest::from_bytes(&buf)
    }
}

impl<P: Into<String>, C: Into<String>> FromIterator<(P, C)> for Fileset {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        Self {
            files: iter
                .into_iter()
                .map(|(p, c)| (p.into(), c.into()))
                .collect(),
        }
    }
}

/// The diff an agent produced: the full content of every file it touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    #[serde(default)]
    pub summary: String,
    pub files: Fileset,
}

impl Changeset {
    pub fn new(summary: impl Into<String>, files: Fileset) -> Self {
        Self {
            summary: summary.into(),
            files,
        }
    }

    /// Identity of the diff. Committee approvals are bound to this value.
    pub fn digest(&self) -> ContentDigest {
        self.files.digest()
    }
}

// ---------------------------------------------------------------------------
// Per-iteration outputs
// ---------------------------------------------------------------------------

/// Outcome of one execution of the test command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub iteration: u32,
    pub exit_code: i32,
    pub log_excerpt: String,
    pub passed: bool,
    pub diff_digest: ContentDigest,
    pub recorded_at: DateTime<Utc>,
}

/// One committee review. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditVerdict {
    /// Committee position (0-indexed) of the reviewing auditor.
    pub position: usize,
    pub auditor: String,
    pub approved: bool,
    pub critical_issues: Vec<String>,
    /// 1-based count of reviews at this position, including this one.
    pub attempt_number: u32,
    pub iteration: u32,
    pub diff_digest: ContentDigest,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// QA analyst verdict over test logs and acceptance scenarios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UatVerdict {
    pub verdict: Verdict,
    pub summary: String,
}

impl UatVerdict {
    pub fn pass(summary: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Pass,
            summary: summary.into(),
        }
    }

    pub fn fail(summary: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Fail,
            summary: summary.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// A UAT verdict stamped with where in the cycle it was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UatRecord {
    pub iteration: u32,
    pub diff_digest: ContentDigest,
    pub verdict: UatVerdict,
    pub recorded_at: DateTime<Utc>,
}

/// Pointer to the external agent session that owns a cycle's work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub cycle_id: CycleId,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Cycle lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Done,
    Failed,
}

impl CycleStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CycleStatus::Running)
    }
}

/// States of the cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    SandboxReady,
    Implementing,
    Testing,
    Auditing,
    Fixing,
    UatEval,
    Merging,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Init => "init",
            Phase::SandboxReady => "sandbox_ready",
            Phase::Implementing => "implementing",
            Phase::Testing => "testing",
            Phase::Auditing => "auditing",
            Phase::Fixing => "fixing",
            Phase::UatEval => "uat_eval",
            Phase::Merging => "merging",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Machine-readable reason a cycle ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    SandboxProvisionError { detail: String },
    SyncError { detail: String },
    AgentTimeout { limit_ms: u64 },
    AgentFailure { detail: String },
    TestExecutionError { detail: String },
    AuditAttemptsExceeded { position: usize, attempts: u32, limit: u32 },
    IterationBudgetExceeded { max_iterations: u32 },
    MergeConflict { detail: String },
    AuditorFailure { position: usize, detail: String },
    QaFailure { detail: String },
    IntegrationFailure { detail: String },
    StorageError { detail: String },
    InvalidConfiguration { detail: String },
    Cancelled,
    Internal { detail: String },
}

impl FailureReason {
    /// Stable snake_case code, identical to the serialized `code` tag.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::SandboxProvisionError { .. } => "sandbox_provision_error",
            FailureReason::SyncError { .. } => "sync_error",
            FailureReason::AgentTimeout { .. } => "agent_timeout",
            FailureReason::AgentFailure { .. } => "agent_failure",
            FailureReason::TestExecutionError { .. } => "test_execution_error",
            FailureReason::AuditAttemptsExceeded { .. } => "audit_attempts_exceeded",
            FailureReason::IterationBudgetExceeded { .. } => "iteration_budget_exceeded",
            FailureReason::MergeConflict { .. } => "merge_conflict",
            FailureReason::AuditorFailure { .. } => "auditor_failure",
            FailureReason::QaFailure { .. } => "qa_failure",
            FailureReason::IntegrationFailure { .. } => "integration_failure",
            FailureReason::StorageError { .. } => "storage_error",
            FailureReason::InvalidConfiguration { .. } => "invalid_configuration",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Internal { .. } => "internal",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::SandboxProvisionError { detail }
            | FailureReason::SyncError { detail }
            | FailureReason::AgentFailure { detail }
            | FailureReason::TestExecutionError { detail }
            | FailureReason::MergeConflict { detail }
            | FailureReason::QaFailure { detail }
            | FailureReason::IntegrationFailure { detail }
            | FailureReason::StorageError { detail }
            | FailureReason::InvalidConfiguration { detail }
            | FailureReason::Internal { detail } => write!(f, "{}: {detail}", self.code()),
            FailureReason::AgentTimeout { limit_ms } => {
                write!(f, "{}: no result within {limit_ms}ms", self.code())
            }
            FailureReason::AuditAttemptsExceeded {
                position,
                attempts,
                limit,
            } => write!(
                f,
                "{}: auditor {position} rejected {attempts} times (limit {limit})",
                self.code()
            ),
            FailureReason::IterationBudgetExceeded { max_iterations } => {
                write!(f, "{}: max_iterations={max_iterations}", self.code())
            }
            FailureReason::AuditorFailure { position, detail } => {
                write!(f, "{}: auditor {position}: {detail}", self.code())
            }
            FailureReason::Cancelled => f.write_str(self.code()),
        }
    }
}

/// Archive of a cycle, written once it reaches `Done` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: CycleId,
    pub integration_branch: String,
    pub status: CycleStatus,
    pub failure_reason: Option<FailureReason>,
    /// Phase the cycle was in when it failed.
    pub failed_in: Option<Phase>,
    pub iteration_count: u32,
    pub committee_position: usize,
    pub committee_size: usize,
    pub attempts: BTreeMap<usize, u32>,
    pub transitions: Vec<Phase>,
    pub tests: Vec<TestRunResult>,
    pub audits: Vec<AuditVerdict>,
    pub uat: Vec<UatRecord>,
    pub session_id: Option<String>,
    pub final_diff_digest: Option<ContentDigest>,
    pub merged_commit: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_id_accepts_simple_ids() {
        assert!(CycleId::new("01").is_ok());
        assert!(CycleId::new("cycle-7.b_2").is_ok());
    }

    #[test]
    fn cycle_id_rejects_path_like_ids() {
        let too_long = "x".repeat(129);
        for bad in ["", ".", "..", "a/b", "../x", "a b", too_long.as_str()] {
            assert!(CycleId::new(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn fileset_digest_is_order_independent() {
        let a: Fileset = [("a.rs", "1"), ("b.rs", "2")].into_iter().collect();
        let b: Fileset = [("b.rs", "2"), ("a.rs", "1")].into_iter().collect();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn fileset_digest_separates_path_and_content() {
        let a: Fileset = [("ab", "c")].into_iter().collect();
        let b: Fileset = [("a", "bc")].into_iter().collect();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn inputs_fileset_skips_missing_schema() {
        let inputs = CycleInputs {
            specification: "spec".into(),
            schema: None,
            acceptance_scenarios: "uat".into(),
        };
        let files = inputs.to_fileset();
        assert_eq!(files.len(), 2);
        assert_eq!(files.get(".accdd/inputs/SPEC.md"), Some("spec"));
        assert_eq!(files.get(".accdd/inputs/UAT.md"), Some("uat"));
    }

    #[test]
    fn failure_reason_code_matches_serde_tag() {
        let reasons = [
            FailureReason::AuditAttemptsExceeded {
                position: 1,
                attempts: 3,
                limit: 2,
            },
            FailureReason::IterationBudgetExceeded { max_iterations: 0 },
            FailureReason::Cancelled,
            FailureReason::MergeConflict {
                detail: "src/lib.rs".into(),
            },
        ];
        for reason in &reasons {
            let json = serde_json::to_value(reason).unwrap();
            assert_eq!(json["code"], reason.code());
            let back: FailureReason = serde_json::from_value(json).unwrap();
            assert_eq!(&back, reason);
        }
    }

    #[test]
    fn failure_reason_display_names_position() {
        let r = FailureReason::AuditAttemptsExceeded {
            position: 2,
            attempts: 3,
            limit: 2,
        };
        let msg = r.to_string();
        assert!(msg.starts_with("audit_attempts_exceeded"));
        assert!(msg.contains("auditor 2"));
    }
}
