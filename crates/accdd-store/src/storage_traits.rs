//! Storage trait definitions for AC-CDD
//!
//! - `ContentDigest`: SHA-256 content address used for diffs and synced files
//! - `ArtifactStore`: cycle-scoped persistence of inputs and outputs
//!
//! The trait is async and backend-agnostic. An in-memory fake is provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::records::{
    AuditVerdict, Changeset, CycleId, CycleInputs, CycleRecord, SessionManifest, TestRunResult,
    UatRecord,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// Cycle artifact store.
///
/// Inputs are read-only for the duration of a cycle. Outputs are keyed by
/// cycle id and, where they repeat, by iteration index:
/// - one diff and one test run per iteration (a rerun of the same
///   iteration overwrites),
/// - an append-only audit history per cycle,
/// - one archived `CycleRecord` per cycle, written at the terminal state.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read the static inputs of a cycle. `NotFound` if the specification
    /// or the acceptance scenarios are missing.
    async fn load_inputs(&self, cycle_id: &CycleId) -> StorageResult<CycleInputs>;

    /// Seed or replace the static inputs of a cycle.
    async fn put_inputs(&self, cycle_id: &CycleId, inputs: &CycleInputs) -> StorageResult<()>;

    /// Store the diff produced at `iteration`, returning its digest.
    async fn put_diff(
        &self,
        cycle_id: &CycleId,
        iteration: u32,
        changeset: &Changeset,
    ) -> StorageResult<ContentDigest>;

    /// Read the diff produced at `iteration`.
    async fn get_diff(&self, cycle_id: &CycleId, iteration: u32) -> StorageResult<Changeset>;

    /// Diff of the highest iteration stored for the cycle, with that
    /// iteration. `None` if no diff was ever stored.
    async fn latest_diff(&self, cycle_id: &CycleId) -> StorageResult<Option<(u32, Changeset)>>;

    /// Store a test run, keyed by its own iteration index.
    async fn put_test_run(&self, cycle_id: &CycleId, run: &TestRunResult) -> StorageResult<()>;

    /// Append a verdict to the cycle's audit history.
    async fn append_audit(&self, cycle_id: &CycleId, verdict: &AuditVerdict) -> StorageResult<()>;

    /// Full audit history in append order.
    async fn audit_history(&self, cycle_id: &CycleId) -> StorageResult<Vec<AuditVerdict>>;

    /// Store a UAT verdict, keyed by its own iteration index.
    async fn put_uat(&self, cycle_id: &CycleId, record: &UatRecord) -> StorageResult<()>;

    /// Agent session recorded for the cycle, if any.
    async fn load_session(&self, cycle_id: &CycleId) -> StorageResult<Option<SessionManifest>>;

    /// Record (or update) the agent session of a cycle.
    async fn save_session(&self, manifest: &SessionManifest) -> StorageResult<()>;

    /// Archive the terminal record of a cycle.
    async fn put_record(&self, record: &CycleRecord) -> StorageResult<()>;

    /// Archived record of a cycle, if it has reached a terminal state.
    async fn get_record(&self, cycle_id: &CycleId) -> StorageResult<Option<CycleRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_from_bytes_is_lowercase_hex() {
        let d = ContentDigest::from_bytes(b"hello");
        assert_eq!(d.as_str().len(), 64);
        assert!(d.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d.short().len(), 12);
    }

    #[test]
    fn digest_try_from_rejects_garbage() {
        assert!(ContentDigest::try_from("xyz".to_string()).is_err());
        assert!(ContentDigest::try_from("g".repeat(64)).is_err());
    }

    #[test]
    fn digest_try_from_normalizes_case() {
        let upper = "AB".repeat(32);
        let d = ContentDigest::try_from(upper).unwrap();
        assert_eq!(d.as_str(), "ab".repeat(32));
    }

    #[test]
    fn digest_deserialize_validates() {
        let bad: Result<ContentDigest, _> = serde_json::from_str("\"not-a-digest\"");
        assert!(bad.is_err());

        let d = ContentDigest::from_bytes(b"x");
        let json = serde_json::to_string(&d).unwrap();
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
