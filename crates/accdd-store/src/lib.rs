//! AC-CDD Store: artifact persistence for development cycles
//!
//! This crate is the storage layer of AC-CDD. It owns the persisted shape of
//! a cycle: the static inputs an implementation agent works from, and the
//! outputs that accumulate while the cycle runs (diffs, test logs, audit
//! verdicts, UAT verdicts, the final archived record).
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: records that are addressable by cycle id and iteration index.
//! No orchestration logic lives here.
//!
//! ## Key Components
//!
//! - `ArtifactStore`: async, backend-agnostic storage trait
//! - `FsArtifactStore`: filesystem backend with atomic writes
//! - `fakes::MemoryArtifactStore`: in-memory backend for tests
//! - `records`: the cycle data model (`CycleRecord`, `AuditVerdict`, ...)

mod error;
pub mod fakes;
mod fs_store;
pub mod records;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_store::FsArtifactStore;
pub use records::{
    AuditVerdict, Changeset, CycleId, CycleInputs, CycleRecord, CycleStatus, FailureReason,
    Fileset, Phase, SessionManifest, TestRunResult, UatRecord, UatVerdict, Verdict,
};
pub use storage_traits::{ArtifactStore, ContentDigest, StorageResult};
