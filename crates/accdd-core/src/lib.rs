//! AC-CDD Core: cycle orchestration
//!
//! Drives one unit of work ("cycle") through implement → test → audit →
//! fix → UAT → merge. An external agent writes the code, an ephemeral
//! sandbox runs the tests, an ordered committee of auditors reviews the
//! diff, a QA analyst checks the acceptance scenarios, and the accepted
//! diff is integrated into a branch.
//!
//! ## Layer 1 - Orchestration
//!
//! Everything outside this process is reached through a narrow trait
//! (`SandboxProvider`, `AgentSession`, `CommitteeAuditor`, `QaAnalyst`,
//! `Integrator`, `accdd_store::ArtifactStore`) and every call to one goes
//! through [`execution::call_with_controls`].
//!
//! ## Key Components
//!
//! - [`CycleController`]: the per-cycle state machine
//! - [`CycleQueue`]: several cycles at once, merges serialized per branch
//! - [`domain`]: committee bookkeeping, iteration budget, fix feedback
//! - [`sandbox`]: `SandboxHandle` lifecycle and the local provider
//! - [`fakes`]: scripted implementations of every boundary for tests

pub mod agent;
pub mod config;
pub mod controller;
pub mod domain;
pub mod execution;
pub mod fakes;
pub mod integrate;
pub mod metrics;
pub mod obs;
pub mod process;
pub mod queue;
pub mod review;
pub mod sandbox;
pub mod telemetry;

pub use agent::{AgentDriver, AgentError, AgentSession, AgentTask, CommandAgent, SessionResult, SessionStatus};
pub use config::{load_settings, CallPolicies, ConfigError, Settings, DEFAULT_CONFIG_FILE};
pub use controller::{ControllerOptions, CycleConfig, CycleController, CycleDeps, CycleOutcome};
pub use domain::{Committee, CycleSession, Feedback};
pub use execution::{call_with_controls, CallError, CallPolicy, CancelHandle, CancelSignal};
pub use integrate::{BranchLocks, GitIntegrator, IntegrationError, Integrator, MergeRequest};
pub use queue::{CycleJob, CycleQueue};
pub use review::{CommandAuditor, CommandQaAnalyst, CommitteeAuditor, QaAnalyst, ReviewContext, ReviewDecision};
pub use sandbox::{LocalSandboxProvider, SandboxHandle, SandboxProvider};
pub use telemetry::init_tracing;
