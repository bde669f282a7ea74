//! Domain models for cycle orchestration.
//!
//! - `CycleSession`: iteration budget and terminal status of one cycle
//! - `Committee`: ordered auditor chain with per-position attempt counts
//! - `Feedback`: what the agent is told when asked to fix its work

pub mod committee;
pub mod feedback;
pub mod session;

pub use committee::{Committee, RejectionOutcome};
pub use feedback::{excerpt_tail, Feedback};
pub use session::CycleSession;
