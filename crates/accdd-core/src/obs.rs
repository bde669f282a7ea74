//! Structured lifecycle events of a cycle.
//!
//! Every function emits one `tracing` event carrying an `event` field, so
//! a JSON log can be filtered on `event = "cycle.*"` without parsing
//! messages. Verbosity follows `ACCDD_LOG` (see [`crate::telemetry`]).

use accdd_store::{ContentDigest, CycleId, FailureReason, Phase};
use tracing::{info, warn};

pub fn emit_cycle_started(
    cycle_id: &CycleId,
    integration_branch: &str,
    committee_size: usize,
    max_iterations: u32,
) {
    info!(
        event = "cycle.started",
        cycle_id = %cycle_id,
        integration_branch = %integration_branch,
        committee_size,
        max_iterations,
    );
}

pub fn emit_transition(cycle_id: &CycleId, from: Phase, to: Phase, iteration: u32) {
    info!(
        event = "cycle.transition",
        cycle_id = %cycle_id,
        from = %from,
        to = %to,
        iteration,
    );
}

pub fn emit_test_run(cycle_id: &CycleId, iteration: u32, exit_code: i32, passed: bool) {
    info!(
        event = "cycle.test_run",
        cycle_id = %cycle_id,
        iteration,
        exit_code,
        passed,
    );
}

pub fn emit_audit_verdict(
    cycle_id: &CycleId,
    position: usize,
    auditor: &str,
    attempt_number: u32,
    approved: bool,
    issue_count: usize,
) {
    info!(
        event = "cycle.audit_verdict",
        cycle_id = %cycle_id,
        position,
        auditor = %auditor,
        attempt_number,
        approved,
        issue_count,
    );
}

pub fn emit_uat_verdict(cycle_id: &CycleId, iteration: u32, passed: bool) {
    info!(event = "cycle.uat_verdict", cycle_id = %cycle_id, iteration, passed);
}

/// Sandbox sync finished. `transferred == 0` means nothing was uploaded.
pub fn emit_sandbox_sync(sandbox_id: &str, transferred: usize, skipped: usize, hash: &ContentDigest) {
    info!(
        event = "sandbox.sync",
        sandbox_id = %sandbox_id,
        transferred,
        skipped,
        hash = %hash.short(),
    );
}

pub fn emit_cycle_finished(
    cycle_id: &CycleId,
    duration_ms: u64,
    iteration_count: u32,
    reason: Option<&FailureReason>,
) {
    match reason {
        None => info!(
            event = "cycle.finished",
            cycle_id = %cycle_id,
            duration_ms,
            iteration_count,
            success = true,
        ),
        Some(reason) => warn!(
            event = "cycle.finished",
            cycle_id = %cycle_id,
            duration_ms,
            iteration_count,
            success = false,
            reason = %reason.code(),
            detail = %reason,
        ),
    }
}

/// The terminal record could not be persisted (warning level).
pub fn emit_finalize_error(cycle_id: &CycleId, error: &dyn std::fmt::Display) {
    warn!(event = "cycle.finalize_error", cycle_id = %cycle_id, error = %error);
}
