//! Sandbox: isolated execution environment for a cycle's work.
//!
//! A [`SandboxProvider`] is the boundary to whatever actually hosts the
//! code (a local temp directory, a remote VM). [`SandboxHandle`] wraps one
//! provisioned sandbox with lifecycle tracking, hash-based sync and
//! guaranteed teardown.
//!
//! # Modules
//!
//! - [`provider`]: `SandboxProvider` trait, `SandboxId`, `ExecOutput`
//! - [`handle`]: `SandboxHandle`, `LifecycleState`, `SyncReport`
//! - [`local`]: `LocalSandboxProvider` (temp directory + child processes)
//! - [`error`]: `SandboxError` / `SandboxResult`

pub mod error;
pub mod handle;
pub mod local;
pub mod provider;

pub use error::{SandboxError, SandboxResult};
pub use handle::{LifecycleState, SandboxHandle, SandboxPolicies, SyncReport};
pub use local::LocalSandboxProvider;
pub use provider::{validate_relative_path, ExecOutput, SandboxId, SandboxProvider};
